//! Workspace path layout.
//!
//! Every installed tool lives at a path derived only from its identity:
//!
//! - `<workspace>/agents/<name>/`
//! - `<workspace>/commands/<name>/`
//! - `<workspace>/skills/<name>/`
//!
//! The ledger file sits at the workspace root. Backups created during an
//! update are hidden siblings of the tool directory so they never show up as
//! installed tools.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use super::error::PackageError;
use super::types::{ToolIdentity, ToolKind};

/// Default ledger file name inside the workspace root.
pub const DEFAULT_LEDGER_FILE: &str = ".agentpack.json";

/// Marker separating a tool name from the backup suffix.
const BACKUP_MARKER: &str = ".backup-";

// ============================================================================
// Workspace Layout
// ============================================================================

/// Resolves every path the package manager touches inside one workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    root: PathBuf,
    ledger_file: String,
}

impl WorkspaceLayout {
    /// Creates a layout rooted at `root` with the default ledger file name.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ledger_file: DEFAULT_LEDGER_FILE.to_string(),
        }
    }

    /// Overrides the ledger file name.
    pub fn with_ledger_file(mut self, name: impl Into<String>) -> Self {
        self.ledger_file = name.into();
        self
    }

    /// Returns the workspace root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the path to the ledger file.
    ///
    /// Path: `<workspace>/.agentpack.json`
    pub fn ledger_path(&self) -> PathBuf {
        self.root.join(&self.ledger_file)
    }

    /// Returns the directory holding every tool of one kind.
    ///
    /// Path: `<workspace>/<kind>s/`
    pub fn kind_dir(&self, kind: ToolKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    /// Returns the install directory for a tool.
    ///
    /// Path: `<workspace>/<kind>s/<name>/`
    pub fn tool_dir(&self, identity: &ToolIdentity) -> PathBuf {
        self.kind_dir(identity.kind).join(&identity.name)
    }

    /// Returns a fresh backup path for a tool being replaced.
    ///
    /// Path: `<workspace>/<kind>s/.<name>.backup-<nanos>/`
    pub fn backup_path(&self, identity: &ToolIdentity) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        self.kind_dir(identity.kind).join(format!(
            ".{}{}{}-{}",
            identity.name,
            BACKUP_MARKER,
            nanos,
            std::process::id()
        ))
    }

    /// Creates the workspace root and kind directories.
    pub fn ensure_dirs_exist(&self) -> Result<(), PackageError> {
        let dirs = std::iter::once(self.root.clone())
            .chain(ToolKind::all().iter().map(|kind| self.kind_dir(*kind)));

        for dir in dirs {
            std::fs::create_dir_all(&dir).map_err(|e| PackageError::io(&dir, e))?;
        }

        Ok(())
    }
}

/// Extracts the tool name from a backup directory name, if it is one.
pub fn backup_owner(file_name: &str) -> Option<&str> {
    let rest = file_name.strip_prefix('.')?;
    let (name, _) = rest.rsplit_once(BACKUP_MARKER)?;
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Extracts the creation time (nanoseconds since the epoch) from a backup
/// directory name.
pub fn backup_started_nanos(file_name: &str) -> Option<u128> {
    backup_owner(file_name)?;
    let (_, suffix) = file_name.rsplit_once(BACKUP_MARKER)?;
    suffix.split('-').next()?.parse().ok()
}
