//! Error taxonomy for package operations.
//!
//! Every component returns [`PackageError`]. Callers that need to decide how to
//! react (suggest a search, retry the download, give up) use
//! [`PackageError::kind`] instead of matching on individual variants.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::extractor::SecurityViolation;
use super::transaction::Stage;
use super::types::ToolIdentity;

// =============================================================================
// Error Classification
// =============================================================================

/// Broad class of a failure, used for recovery decisions.
///
/// "Already satisfied" outcomes are not errors; they are reported through
/// `InstallReport::skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageErrorKind {
    /// Tool, version or ledger entry does not exist.
    NotFound,
    /// Archive failed a structural safety check.
    SecurityViolation,
    /// Content hash did not match the expected digest.
    IntegrityFailure,
    /// Network failure that survived the retry policy.
    TransientIo,
    /// Ledger unreadable or ledger and disk disagree.
    StateCorruption,
    /// The OS refused a filesystem operation.
    PermissionDenied,
    /// The caller cancelled the operation.
    Cancelled,
    /// Malformed user input such as a bad specifier.
    InvalidInput,
    /// Any other local I/O failure.
    Io,
}

// =============================================================================
// Error Type
// =============================================================================

/// Errors produced by the extractor, ledger and orchestrators.
#[derive(Debug, Error)]
pub enum PackageError {
    #[error("{identity} was not found in the catalog")]
    ToolNotFound { identity: ToolIdentity },

    #[error("version {version} of {identity} was not found in the catalog (available: {available})")]
    VersionNotFound {
        identity: ToolIdentity,
        version: String,
        available: String,
    },

    #[error("{0} is not installed")]
    NotInstalled(ToolIdentity),

    #[error("download of {url} was rejected with HTTP {status}")]
    FetchRejected { url: String, status: u16 },

    #[error("download URL {url} is not allowed: {reason}")]
    UrlNotAllowed { url: String, reason: String },

    #[error("download of {url} exceeds the {limit} byte limit")]
    DownloadTooLarge { url: String, limit: u64 },

    #[error("archive rejected: {0}")]
    Security(#[from] SecurityViolation),

    #[error("integrity check failed for {}\n  expected: {expected}\n  actual:   {actual}", path.display())]
    IntegrityMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("network error fetching {url} after {attempts} attempt(s): {message}")]
    Transient {
        url: String,
        attempts: u32,
        message: String,
    },

    #[error("ledger at {} is corrupt: {message}", path.display())]
    LedgerCorrupt { path: PathBuf, message: String },

    #[error("refusing to save invalid ledger: {0}")]
    InvalidLedger(String),

    #[error("{identity} is recorded as installed but {reason}")]
    Diverged {
        identity: ToolIdentity,
        reason: String,
    },

    #[error("permission denied: {}", path.display())]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid tool specifier '{input}': {reason}")]
    InvalidSpec { input: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{identity}: {stage} failed: {source}")]
    Stage {
        identity: ToolIdentity,
        stage: Stage,
        #[source]
        source: Box<PackageError>,
    },

    #[error("{identity}: rollback after failed {stage} did not complete ({rollback}); original error: {cause}")]
    RollbackFailed {
        identity: ToolIdentity,
        stage: Stage,
        cause: Box<PackageError>,
        rollback: Box<PackageError>,
    },
}

impl PackageError {
    /// Wraps an I/O error with the path it concerns.
    ///
    /// `PermissionDenied` errors are kept distinct so the offending path is
    /// reported as such.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        if source.kind() == io::ErrorKind::PermissionDenied {
            Self::PermissionDenied { path, source }
        } else {
            Self::Io { path, source }
        }
    }

    /// Attaches the orchestration stage and tool to an error.
    pub fn at_stage(self, identity: &ToolIdentity, stage: Stage) -> Self {
        match self {
            // Already carries context.
            e @ (Self::Stage { .. } | Self::RollbackFailed { .. }) => e,
            e => Self::Stage {
                identity: identity.clone(),
                stage,
                source: Box::new(e),
            },
        }
    }

    /// Classifies the error for recovery decisions.
    pub fn kind(&self) -> PackageErrorKind {
        match self {
            Self::ToolNotFound { .. }
            | Self::VersionNotFound { .. }
            | Self::NotInstalled(_)
            | Self::FetchRejected { .. } => PackageErrorKind::NotFound,
            Self::UrlNotAllowed { .. }
            | Self::DownloadTooLarge { .. }
            | Self::Security(_) => PackageErrorKind::SecurityViolation,
            Self::IntegrityMismatch { .. } => PackageErrorKind::IntegrityFailure,
            Self::Transient { .. } => PackageErrorKind::TransientIo,
            Self::LedgerCorrupt { .. }
            | Self::InvalidLedger(_)
            | Self::Diverged { .. }
            | Self::RollbackFailed { .. } => PackageErrorKind::StateCorruption,
            Self::PermissionDenied { .. } => PackageErrorKind::PermissionDenied,
            Self::Io { .. } => PackageErrorKind::Io,
            Self::InvalidSpec { .. } => PackageErrorKind::InvalidInput,
            Self::Cancelled => PackageErrorKind::Cancelled,
            Self::Stage { source, .. } => source.kind(),
        }
    }

    /// Returns the innermost error, skipping stage context.
    pub fn root(&self) -> &PackageError {
        match self {
            Self::Stage { source, .. } => source.root(),
            e => e,
        }
    }

    /// Returns true if the error means the thing asked for does not exist.
    pub fn is_not_found(&self) -> bool {
        self.kind() == PackageErrorKind::NotFound
    }
}
