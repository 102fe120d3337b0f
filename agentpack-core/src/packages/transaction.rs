//! Backup, replace and rollback for a single install.
//!
//! An [`InstallTransaction`] owns everything one install touches besides the
//! ledger: a process-private temp directory holding the downloaded archive,
//! the destination directory and, for updates, the backup the previous
//! contents were renamed to. The installer drives it through the [`Stage`]s;
//! the transaction knows how to undo whatever the current stage did.
//!
//! A transaction dropped while still pending after it touched the destination
//! rolls itself back, so an abandoned install future leaves the workspace as
//! it was.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use super::error::PackageError;
use super::paths::WorkspaceLayout;
use super::types::ToolIdentity;

// ============================================================================
// Stages
// ============================================================================

/// Install state machine stages.
///
/// `Resolving → Downloading → Verifying → BackingUp → Extracting →
/// CommittingLedger → Done`, with `RollingBack` reachable from `Extracting`
/// and `CommittingLedger`, and `Failed` reachable from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolving,
    Downloading,
    Verifying,
    BackingUp,
    Extracting,
    CommittingLedger,
    RollingBack,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Resolving => "resolving",
            Stage::Downloading => "downloading",
            Stage::Verifying => "verifying",
            Stage::BackingUp => "backing up",
            Stage::Extracting => "extracting",
            Stage::CommittingLedger => "committing ledger",
            Stage::RollingBack => "rolling back",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }

    /// Stages whose failure requires restoring the destination.
    fn touches_destination(&self) -> bool {
        matches!(self, Stage::Extracting | Stage::CommittingLedger)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Committed,
    /// Destination restored to its pre-install state.
    RolledBack,
    /// Aborted before anything on disk changed.
    Failed,
}

// ============================================================================
// Install Transaction
// ============================================================================

/// On-disk side of one install or update.
#[derive(Debug)]
pub struct InstallTransaction {
    identity: ToolIdentity,
    destination: PathBuf,
    planned_backup: PathBuf,
    backup: Option<PathBuf>,
    temp_dir: TempDir,
    archive_path: PathBuf,
    integrity: Option<String>,
    stage: Stage,
    outcome: Outcome,
}

impl InstallTransaction {
    /// Starts a transaction for `identity`, creating its private temp directory.
    pub fn begin(layout: &WorkspaceLayout, identity: &ToolIdentity) -> Result<Self, PackageError> {
        let temp_dir = tempfile::Builder::new()
            .prefix("agentpack-")
            .tempdir()
            .map_err(|e| PackageError::io(std::env::temp_dir(), e))?;
        let archive_path = temp_dir.path().join(format!("{}.archive", identity.name));

        Ok(Self {
            identity: identity.clone(),
            destination: layout.tool_dir(identity),
            planned_backup: layout.backup_path(identity),
            backup: None,
            temp_dir,
            archive_path,
            integrity: None,
            stage: Stage::Resolving,
            outcome: Outcome::Pending,
        })
    }

    pub fn identity(&self) -> &ToolIdentity {
        &self.identity
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// Final install directory.
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Where the downloaded archive is written.
    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    /// Process-private scratch directory.
    pub fn temp_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Backup of the previous contents, once taken.
    pub fn backup_path(&self) -> Option<&Path> {
        self.backup.as_deref()
    }

    pub fn integrity(&self) -> Option<&str> {
        self.integrity.as_deref()
    }

    /// Records the computed archive hash.
    pub fn record_integrity(&mut self, integrity: impl Into<String>) {
        self.integrity = Some(integrity.into());
    }

    /// Moves to `stage`.
    pub fn enter(&mut self, stage: Stage) {
        debug!(tool = %self.identity, stage = %stage, "Entering stage");
        self.stage = stage;
    }

    /// Renames an existing destination to the backup path.
    ///
    /// Returns true if a backup was taken. On failure nothing has changed.
    pub fn back_up(&mut self) -> Result<bool, PackageError> {
        if fs::symlink_metadata(&self.destination).is_err() {
            return Ok(false);
        }

        fs::rename(&self.destination, &self.planned_backup)
            .map_err(|e| PackageError::io(&self.destination, e))?;
        debug!(
            tool = %self.identity,
            backup = %self.planned_backup.display(),
            "Backed up previous installation"
        );
        self.backup = Some(self.planned_backup.clone());
        Ok(true)
    }

    /// Marks the transaction failed without touching the destination.
    pub fn abort(&mut self) {
        self.stage = Stage::Failed;
        self.outcome = Outcome::Failed;
    }

    /// Removes whatever was written to the destination and restores the backup.
    pub fn roll_back(&mut self) -> Result<(), PackageError> {
        let failed_stage = self.stage;
        self.enter(Stage::RollingBack);

        remove_path(&self.destination)?;

        if let Some(backup) = self.backup.take() {
            if let Err(e) = fs::rename(&backup, &self.destination) {
                self.backup = Some(backup.clone());
                self.stage = Stage::Failed;
                return Err(PackageError::io(&backup, e));
            }
        }

        info!(
            tool = %self.identity,
            stage = %failed_stage,
            "Rolled back installation"
        );
        self.stage = Stage::Failed;
        self.outcome = Outcome::RolledBack;
        Ok(())
    }

    /// Finishes the transaction, deleting the backup and temp directory.
    ///
    /// The install is already durable at this point, so a backup that cannot
    /// be removed is only logged.
    pub fn commit(mut self) {
        if let Some(backup) = self.backup.take() {
            if let Err(e) = fs::remove_dir_all(&backup) {
                warn!(
                    tool = %self.identity,
                    backup = %backup.display(),
                    "Failed to remove backup: {}",
                    e
                );
            }
        }
        self.stage = Stage::Done;
        self.outcome = Outcome::Committed;
    }
}

impl Drop for InstallTransaction {
    fn drop(&mut self) {
        if self.outcome != Outcome::Pending {
            return;
        }
        if !self.stage.touches_destination() && self.backup.is_none() {
            return;
        }

        warn!(
            tool = %self.identity,
            stage = %self.stage,
            "Install abandoned mid-transaction, rolling back"
        );
        if let Err(e) = self.roll_back() {
            warn!(tool = %self.identity, "Rollback of abandoned install failed: {}", e);
        }
    }
}

/// Removes a file or directory tree if present.
fn remove_path(path: &Path) -> Result<(), PackageError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(_) => return Ok(()),
    }
    .map_err(|e| PackageError::io(path, e))
}
