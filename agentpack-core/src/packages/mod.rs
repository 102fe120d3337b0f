//! Tool bundle package management.
//!
//! This module installs agent, command and skill bundles fetched from a remote
//! catalog into a local workspace. Every state change is either committed in
//! full or rolled back, so the workspace directories and the ledger never
//! disagree about what is installed.
//!
//! # Architecture
//!
//! - `types`: Core types (ToolKind, ToolIdentity, ToolSpec, InstalledRecord)
//! - `error`: Error taxonomy shared by every component
//! - `version`: Version ordering used for update detection
//! - `paths`: Deterministic workspace layout
//! - `extractor`: Validating archive extraction, packing and hashing
//! - `ledger`: Atomic, lock-guarded persistence of installed tool state
//! - `catalog`: Catalog client capability and a static in-memory catalog
//! - `downloader`: Archive fetching with retry, timeout and rate-limit handling
//! - `transaction`: Backup and rollback state machine for one install
//! - `installer`: Install, uninstall and verify orchestration
//! - `updater`: Outdated detection and update orchestration
//!
//! # Example
//!
//! ```ignore
//! use agentpack_core::packages::{Installer, ToolKind, ToolSpec};
//! use tokio_util::sync::CancellationToken;
//!
//! let installer = Installer::from_settings(&settings, catalog)?;
//! let spec = ToolSpec::parse("code-reviewer@1.2.0", ToolKind::Agent)?;
//!
//! let report = installer.install(&spec, &CancellationToken::new()).await?;
//! println!("{}", report);
//! ```

pub mod catalog;
pub mod downloader;
pub mod error;
pub mod extractor;
pub mod installer;
pub mod ledger;
pub mod paths;
pub mod transaction;
pub mod types;
pub mod updater;
pub mod version;

// Re-export commonly used types
pub use catalog::{CatalogClient, ResolvedTool, StaticCatalog, VersionInfo};
pub use downloader::{
    default_retry_predicate, ArchiveFetcher, DownloadProgress, FetchFailure, HttpFetcher,
    RetryPolicy, UrlPolicy, DEFAULT_MAX_DOWNLOAD_BYTES,
};
pub use error::{PackageError, PackageErrorKind};
pub use extractor::{
    create_archive, extract_archive, hash_file, scan_archive, verify_file, ArchiveEntry,
    ArchiveExtractor, ArchiveFormat, ExtractSummary, SecureExtractor, SecurityLimits,
    SecurityViolation,
};
pub use installer::{Installer, DEFAULT_SOURCE_TAG};
pub use ledger::{Ledger, LedgerFile, ToolLedger, LEDGER_SCHEMA_VERSION};
pub use paths::WorkspaceLayout;
pub use transaction::{InstallTransaction, Outcome, Stage};
pub use types::{
    BatchReport, InstallReport, InstalledRecord, InstalledTool, OutdatedEntry, ToolIdentity,
    ToolKind, ToolSpec, ToolStatus,
};
pub use updater::Updater;
pub use version::{compare_versions, Version};
