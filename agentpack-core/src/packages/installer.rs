//! Installation orchestrator.
//!
//! [`Installer`] wires the catalog, fetcher, extractor and ledger capabilities
//! together and drives each install through the [`Stage`] state machine. The
//! rule it maintains is that a tool directory exists on disk exactly when the
//! ledger has a record for it: any failure after the destination was touched
//! rolls the workspace back to its pre-install state before the error is
//! returned.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Settings;

use super::catalog::CatalogClient;
use super::downloader::{ArchiveFetcher, HttpFetcher};
use super::error::PackageError;
use super::extractor::{ArchiveExtractor, SecureExtractor};
use super::ledger::{LedgerFile, ToolLedger};
use super::paths::{backup_owner, backup_started_nanos, WorkspaceLayout};
use super::transaction::{InstallTransaction, Stage};
use super::types::{
    BatchReport, InstallReport, InstalledRecord, InstalledTool, ToolIdentity, ToolKind, ToolSpec,
    ToolStatus,
};
use super::version::compare_versions;

/// Default origin tag stored in ledger records.
pub const DEFAULT_SOURCE_TAG: &str = "registry";

/// Drives installs, uninstalls and structural verification for one workspace.
pub struct Installer {
    layout: WorkspaceLayout,
    catalog: Arc<dyn CatalogClient>,
    fetcher: Arc<dyn ArchiveFetcher>,
    extractor: Arc<dyn ArchiveExtractor>,
    ledger: Arc<dyn ToolLedger>,
    source_tag: String,
    show_progress: bool,
}

impl Installer {
    /// Creates an installer from explicit capabilities.
    pub fn new(
        layout: WorkspaceLayout,
        catalog: Arc<dyn CatalogClient>,
        fetcher: Arc<dyn ArchiveFetcher>,
        extractor: Arc<dyn ArchiveExtractor>,
        ledger: Arc<dyn ToolLedger>,
    ) -> Self {
        Self {
            layout,
            catalog,
            fetcher,
            extractor,
            ledger,
            source_tag: DEFAULT_SOURCE_TAG.to_string(),
            show_progress: false,
        }
    }

    /// Creates an installer with the file ledger, secure extractor and HTTP
    /// fetcher configured by `settings`.
    pub fn from_settings(
        settings: &Settings,
        catalog: Arc<dyn CatalogClient>,
    ) -> Result<Self, PackageError> {
        let layout = settings.layout();
        layout.ensure_dirs_exist()?;

        let ledger = Arc::new(LedgerFile::new(layout.ledger_path()));
        let extractor = Arc::new(SecureExtractor::new(
            layout.root().to_path_buf(),
            settings.limits,
        ));
        let fetcher = Arc::new(
            HttpFetcher::new(settings.retry, settings.url_policy())
                .with_max_bytes(settings.limits.max_total_uncompressed_bytes),
        );

        info!(
            "Installer initialized: workspace={}, ledger={}",
            layout.root().display(),
            layout.ledger_path().display()
        );

        Ok(Self::new(layout, catalog, fetcher, extractor, ledger)
            .with_source_tag(settings.source_tag.clone())
            .with_progress(settings.show_progress))
    }

    /// Sets the origin tag stored in new ledger records.
    pub fn with_source_tag(mut self, source_tag: impl Into<String>) -> Self {
        self.source_tag = source_tag.into();
        self
    }

    /// Asks the fetcher to report download progress.
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogClient> {
        &self.catalog
    }

    pub fn ledger(&self) -> &Arc<dyn ToolLedger> {
        &self.ledger
    }

    // ========================================================================
    // Installation
    // ========================================================================

    /// Installs a tool, or updates it if another version is installed.
    ///
    /// Installing the version that is already present is a no-op reported
    /// with `skipped = true`.
    pub async fn install(
        &self,
        spec: &ToolSpec,
        cancel: &CancellationToken,
    ) -> Result<InstallReport, PackageError> {
        let identity = &spec.identity;
        ensure_not_cancelled(cancel).map_err(|e| e.at_stage(identity, Stage::Resolving))?;

        // Resolving
        let resolved = self
            .catalog
            .get_tool_version(identity, spec.version.as_deref())
            .await
            .map_err(|e| e.at_stage(identity, Stage::Resolving))?;
        let version = resolved.version;

        let existing = self
            .installed_record(identity)
            .await
            .map_err(|e| e.at_stage(identity, Stage::Resolving))?;

        if let Some(record) = &existing {
            if compare_versions(&record.version, &version.version) == Ordering::Equal {
                if dir_has_entries(&self.layout.tool_dir(identity)) {
                    info!(tool = %identity, version = %record.version, "Already installed, skipping");
                    return Ok(InstallReport {
                        identity: identity.clone(),
                        old_version: Some(record.version.clone()),
                        new_version: record.version.clone(),
                        skipped: true,
                        integrity: None,
                    });
                }
                warn!(
                    tool = %identity,
                    "Recorded as installed but directory is missing or empty, reinstalling"
                );
            }
        }

        info!(
            tool = %identity,
            "Installing {} from {}",
            version.version,
            version.archive_url
        );

        let mut tx = InstallTransaction::begin(&self.layout, identity)?;

        // Downloading
        tx.enter(Stage::Downloading);
        let bytes = match self
            .fetcher
            .fetch(&version.archive_url, version.size, self.show_progress, cancel)
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => return Err(abort(&mut tx, e)),
        };
        if let Err(e) = tokio::fs::write(tx.archive_path(), &bytes).await {
            let e = PackageError::io(tx.archive_path(), e);
            return Err(abort(&mut tx, e));
        }
        drop(bytes);

        // Verifying
        tx.enter(Stage::Verifying);
        let integrity = match self.verify_archive(tx.archive_path(), version.declared_hash.as_deref()) {
            Ok(integrity) => integrity,
            Err(e) => return Err(abort(&mut tx, e)),
        };
        tx.record_integrity(integrity.clone());

        if let Err(e) = ensure_not_cancelled(cancel) {
            return Err(abort(&mut tx, e));
        }

        // Backing up
        tx.enter(Stage::BackingUp);
        if let Err(e) = self.layout.ensure_dirs_exist() {
            return Err(abort(&mut tx, e));
        }
        if let Err(e) = tx.back_up() {
            return Err(abort(&mut tx, e));
        }

        // Extracting
        tx.enter(Stage::Extracting);
        let extracted = ensure_not_cancelled(cancel).and_then(|_| {
            self.extractor
                .extract(tx.archive_path(), tx.destination(), cancel)
        });
        match extracted {
            Ok(summary) => debug!(
                tool = %identity,
                "Extracted {} files ({} bytes)",
                summary.files,
                summary.bytes_written
            ),
            Err(e) => return Err(roll_back(&mut tx, e)),
        }

        // Committing ledger
        tx.enter(Stage::CommittingLedger);
        let record = InstalledRecord::new(
            identity.kind,
            version.version.clone(),
            self.source_tag.clone(),
            integrity.clone(),
        );
        if let Err(e) = self.ledger.add_or_update(identity, record).await {
            return Err(roll_back(&mut tx, e));
        }

        tx.commit();
        self.record_origin().await;

        let old_version = existing.map(|r| r.version);
        match &old_version {
            Some(old) => info!(tool = %identity, "Updated {} -> {}", old, version.version),
            None => info!(tool = %identity, "Installed {}", version.version),
        }

        Ok(InstallReport {
            identity: identity.clone(),
            old_version,
            new_version: version.version,
            skipped: false,
            integrity: Some(integrity),
        })
    }

    /// Installs several tools one after another.
    ///
    /// A failure is recorded against its specifier and does not stop the
    /// remaining installs.
    pub async fn install_multiple(
        &self,
        specs: &[ToolSpec],
        cancel: &CancellationToken,
    ) -> BatchReport {
        let mut report = BatchReport::default();

        for spec in specs {
            match self.install(spec, cancel).await {
                Ok(result) => report.results.push(result),
                Err(e) => {
                    warn!(tool = %spec, "Install failed: {}", e);
                    report.errors.push((spec.to_string(), e));
                }
            }
        }

        info!(
            "Batch install finished: {} succeeded, {} failed",
            report.results.len(),
            report.errors.len()
        );
        report
    }

    /// Hashes the downloaded archive and checks it against the catalog's
    /// declared hash when one is published.
    fn verify_archive(&self, archive: &Path, declared: Option<&str>) -> Result<String, PackageError> {
        let actual = self.extractor.hash(archive)?;

        if let Some(expected) = declared {
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                return Err(PackageError::IntegrityMismatch {
                    path: archive.to_path_buf(),
                    expected: expected.trim().to_ascii_lowercase(),
                    actual,
                });
            }
            debug!("Archive matches declared SHA256");
        }

        Ok(actual)
    }

    /// Records the catalog origin the first time anything is installed.
    async fn record_origin(&self) {
        let result = async {
            if self.ledger.origin().await?.is_none() {
                let origin = self.catalog.registry_origin().await?;
                self.ledger.set_origin(&origin).await?;
            }
            Ok::<_, PackageError>(())
        }
        .await;

        if let Err(e) = result {
            warn!("Failed to record registry origin: {}", e);
        }
    }

    // ========================================================================
    // Uninstall / Verify / Status
    // ========================================================================

    /// Removes an installed tool.
    ///
    /// The directory goes first; the ledger record is removed only once the
    /// directory is gone. Leftover backups of the tool are deleted last.
    pub async fn uninstall(&self, identity: &ToolIdentity) -> Result<InstalledRecord, PackageError> {
        self.ledger.get(identity).await?;

        let dir = self.layout.tool_dir(identity);
        info!(tool = %identity, "Uninstalling from {}", dir.display());

        if tokio::fs::symlink_metadata(&dir).await.is_ok() {
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|e| PackageError::io(&dir, e))?;
        }

        let record = self.ledger.remove(identity).await?;
        self.remove_backups(identity);
        info!(tool = %identity, "Uninstalled {}", record.version);
        Ok(record)
    }

    /// Checks that an installed tool's directory exists and is non-empty.
    pub async fn verify(&self, identity: &ToolIdentity) -> Result<InstalledTool, PackageError> {
        let record = self.ledger.get(identity).await?;
        let path = self.layout.tool_dir(identity);

        if let Some(reason) = on_disk_problem(&path) {
            return Err(PackageError::Diverged {
                identity: identity.clone(),
                reason,
            });
        }

        Ok(InstalledTool {
            identity: identity.clone(),
            record,
            path,
        })
    }

    /// Returns the installation status of a tool.
    pub async fn status(&self, identity: &ToolIdentity) -> Result<ToolStatus, PackageError> {
        let record = match self.installed_record(identity).await? {
            Some(record) => record,
            None => return Ok(ToolStatus::NotInstalled),
        };

        Ok(match on_disk_problem(&self.layout.tool_dir(identity)) {
            None => ToolStatus::Installed {
                version: record.version,
            },
            Some(reason) => ToolStatus::Broken {
                version: record.version,
                reason,
            },
        })
    }

    /// Returns true if the ledger has a record for the tool.
    pub async fn is_installed(&self, identity: &ToolIdentity) -> Result<bool, PackageError> {
        self.ledger.is_installed(identity).await
    }

    /// Lists every installed tool with its directory.
    pub async fn list_installed(&self) -> Result<Vec<InstalledTool>, PackageError> {
        let records = self.ledger.list().await?;
        Ok(records
            .into_iter()
            .map(|(identity, record)| {
                let path = self.layout.tool_dir(&identity);
                InstalledTool {
                    identity,
                    record,
                    path,
                }
            })
            .collect())
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Resolves backups left behind by an interrupted install.
    ///
    /// A backup with no ledger record belongs to a tool that was uninstalled
    /// since, and a backup older than the tool's ledger record belongs to an
    /// update that committed; both are deleted. Any other backup is restored
    /// over whatever partial directory sits at the destination. Must not run
    /// concurrently with installs on the same workspace. Returns the number of
    /// backups handled.
    pub async fn recover(&self) -> Result<usize, PackageError> {
        let records = self.ledger.list().await?;
        let mut handled = 0;

        for kind in ToolKind::all() {
            for (owner, backup, started) in find_backups(&self.layout.kind_dir(*kind))? {
                let Ok(identity) = ToolIdentity::new(*kind, &owner) else {
                    continue;
                };

                match records.get(&identity) {
                    None => {
                        info!(tool = %identity, "Removing backup of uninstalled tool {}", backup.display());
                        fs::remove_dir_all(&backup).map_err(|e| PackageError::io(&backup, e))?;
                    }
                    Some(record) if committed_after(record, started) => {
                        info!(tool = %identity, "Removing stale backup {}", backup.display());
                        fs::remove_dir_all(&backup).map_err(|e| PackageError::io(&backup, e))?;
                    }
                    Some(_) => {
                        let dest = self.layout.tool_dir(&identity);
                        warn!(tool = %identity, "Restoring interrupted install from {}", backup.display());
                        if dest.exists() {
                            fs::remove_dir_all(&dest).map_err(|e| PackageError::io(&dest, e))?;
                        }
                        fs::rename(&backup, &dest).map_err(|e| PackageError::io(&backup, e))?;
                    }
                }
                handled += 1;
            }
        }

        Ok(handled)
    }

    // ========================================================================
    // Helper Methods
    // ========================================================================

    /// Deletes backups left behind for a tool by interrupted installs.
    ///
    /// Failures are only logged: `recover` deletes backups without a ledger
    /// record anyway.
    fn remove_backups(&self, identity: &ToolIdentity) {
        let backups = match find_backups(&self.layout.kind_dir(identity.kind)) {
            Ok(backups) => backups,
            Err(e) => {
                warn!(tool = %identity, "Failed to scan for stale backups: {}", e);
                return;
            }
        };

        for (_, backup, _) in backups.into_iter().filter(|(owner, _, _)| *owner == identity.name) {
            debug!(tool = %identity, "Removing stale backup {}", backup.display());
            if let Err(e) = fs::remove_dir_all(&backup) {
                warn!(tool = %identity, "Failed to remove stale backup {}: {}", backup.display(), e);
            }
        }
    }

    /// Ledger record for a tool, or None if it is not installed.
    async fn installed_record(
        &self,
        identity: &ToolIdentity,
    ) -> Result<Option<InstalledRecord>, PackageError> {
        match self.ledger.get(identity).await {
            Ok(record) => Ok(Some(record)),
            Err(PackageError::NotInstalled(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<(), PackageError> {
    if cancel.is_cancelled() {
        Err(PackageError::Cancelled)
    } else {
        Ok(())
    }
}

/// Fails a transaction that has not touched the destination yet.
fn abort(tx: &mut InstallTransaction, cause: PackageError) -> PackageError {
    let stage = tx.stage();
    warn!(tool = %tx.identity(), stage = %stage, "Install failed: {}", cause);
    tx.abort();
    cause.at_stage(tx.identity(), stage)
}

/// Rolls a transaction back after a failure at its current stage.
fn roll_back(tx: &mut InstallTransaction, cause: PackageError) -> PackageError {
    let stage = tx.stage();
    let identity = tx.identity().clone();
    warn!(tool = %identity, stage = %stage, "Install failed, rolling back: {}", cause);

    match tx.roll_back() {
        Ok(()) => cause.at_stage(&identity, stage),
        Err(rollback) => PackageError::RollbackFailed {
            identity,
            stage,
            cause: Box::new(cause),
            rollback: Box::new(rollback),
        },
    }
}

/// Lists the backup directories under a kind directory as
/// `(owner name, path, creation nanos)`.
fn find_backups(kind_dir: &Path) -> Result<Vec<(String, PathBuf, u128)>, PackageError> {
    let entries = match fs::read_dir(kind_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PackageError::io(kind_dir, e)),
    };

    let mut backups = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| PackageError::io(kind_dir, e))?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if let Some(owner) = backup_owner(file_name) {
            let started = backup_started_nanos(file_name).unwrap_or(0);
            backups.push((owner.to_string(), entry.path(), started));
        }
    }
    Ok(backups)
}

/// True if the record was written after the backup was taken.
fn committed_after(record: &InstalledRecord, backup_started: u128) -> bool {
    record
        .installed_at
        .timestamp_nanos_opt()
        .is_some_and(|nanos| nanos > 0 && nanos as u128 > backup_started)
}

fn dir_has_entries(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Describes what is wrong with an installed tool's directory, if anything.
fn on_disk_problem(path: &Path) -> Option<String> {
    if !path.is_dir() {
        Some(format!("its directory {} is missing", path.display()))
    } else if !dir_has_entries(path) {
        Some(format!("its directory {} is empty", path.display()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::catalog::{StaticCatalog, VersionInfo};
    use crate::packages::downloader::MockArchiveFetcher;
    use crate::packages::error::PackageErrorKind;
    use crate::packages::extractor::{create_archive, hash_file, MockArchiveExtractor, SecurityLimits};
    use crate::packages::ledger::MockToolLedger;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use tempfile::TempDir;

    const ORIGIN: &str = "https://github.com/acme/tools";

    /// Serves archives from memory, keyed by URL.
    #[derive(Default)]
    struct MemoryFetcher {
        archives: HashMap<String, Vec<u8>>,
        fetches: AtomicUsize,
    }

    impl MemoryFetcher {
        fn with(mut self, url: &str, bytes: Vec<u8>) -> Self {
            self.archives.insert(url.to_string(), bytes);
            self
        }
    }

    #[async_trait]
    impl ArchiveFetcher for MemoryFetcher {
        async fn fetch(
            &self,
            url: &str,
            _expected_size: u64,
            _show_progress: bool,
            cancel: &CancellationToken,
        ) -> Result<Vec<u8>, PackageError> {
            if cancel.is_cancelled() {
                return Err(PackageError::Cancelled);
            }
            self.fetches.fetch_add(1, AtomicOrdering::SeqCst);
            self.archives
                .get(url)
                .cloned()
                .ok_or_else(|| PackageError::FetchRejected {
                    url: url.to_string(),
                    status: 404,
                })
        }
    }

    /// Builds a zip archive with one `agent.md` file.
    fn tool_archive(scratch: &Path, label: &str, content: &str) -> Vec<u8> {
        let src = scratch.join(format!("src-{}", label));
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("agent.md"), content).unwrap();
        let archive = scratch.join(format!("{}.zip", label));
        create_archive(&src, &archive).unwrap();
        fs::read(&archive).unwrap()
    }

    struct Fixture {
        _tmp: TempDir,
        scratch: TempDir,
        layout: WorkspaceLayout,
        identity: ToolIdentity,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let layout = WorkspaceLayout::new(tmp.path().join("workspace"));
            layout.ensure_dirs_exist().unwrap();
            Self {
                _tmp: tmp,
                scratch: TempDir::new().unwrap(),
                layout,
                identity: ToolIdentity::agent("code-reviewer").unwrap(),
            }
        }

        fn catalog(&self) -> StaticCatalog {
            StaticCatalog::new(ORIGIN)
                .with_version(self.identity.clone(), VersionInfo::new("1.0.0", "mem://v1.zip"))
                .with_version(self.identity.clone(), VersionInfo::new("2.0.0", "mem://v2.zip"))
        }

        fn fetcher(&self) -> MemoryFetcher {
            MemoryFetcher::default()
                .with("mem://v1.zip", tool_archive(self.scratch.path(), "v1", "version one"))
                .with("mem://v2.zip", tool_archive(self.scratch.path(), "v2", "version two"))
        }

        fn installer_with(
            &self,
            catalog: StaticCatalog,
            fetcher: Arc<dyn ArchiveFetcher>,
            extractor: Arc<dyn ArchiveExtractor>,
            ledger: Arc<dyn ToolLedger>,
        ) -> Installer {
            Installer::new(self.layout.clone(), Arc::new(catalog), fetcher, extractor, ledger)
        }

        fn installer(&self) -> Installer {
            self.installer_with(
                self.catalog(),
                Arc::new(self.fetcher()),
                Arc::new(SecureExtractor::new(
                    self.layout.root().to_path_buf(),
                    SecurityLimits::default(),
                )),
                Arc::new(LedgerFile::new(self.layout.ledger_path())),
            )
        }

        fn installed_content(&self) -> String {
            fs::read_to_string(self.layout.tool_dir(&self.identity).join("agent.md")).unwrap()
        }

        fn spec(&self, version: &str) -> ToolSpec {
            ToolSpec::new(self.identity.clone(), Some(version.to_string()))
        }
    }

    #[tokio::test]
    async fn test_install_fresh_tool() {
        let fx = Fixture::new();
        let installer = fx.installer();

        let report = installer
            .install(&fx.spec("1.0.0"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!report.skipped);
        assert_eq!(report.old_version, None);
        assert_eq!(report.new_version, "1.0.0");
        assert_eq!(fx.installed_content(), "version one");

        let record = installer.ledger().get(&fx.identity).await.unwrap();
        assert_eq!(record.version, "1.0.0");
        assert_eq!(record.source, DEFAULT_SOURCE_TAG);
        assert_eq!(Some(record.integrity), report.integrity);
        assert_eq!(installer.ledger().origin().await.unwrap().as_deref(), Some(ORIGIN));
    }

    #[tokio::test]
    async fn test_install_latest_when_no_version_requested() {
        let fx = Fixture::new();
        let report = fx
            .installer()
            .install(&ToolSpec::new(fx.identity.clone(), None), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.new_version, "2.0.0");
        assert_eq!(fx.installed_content(), "version two");
    }

    #[tokio::test]
    async fn test_install_is_idempotent() {
        let fx = Fixture::new();
        let fetcher = Arc::new(fx.fetcher());
        let installer = fx.installer_with(
            fx.catalog(),
            fetcher.clone(),
            Arc::new(SecureExtractor::new(fx.layout.root().to_path_buf(), SecurityLimits::default())),
            Arc::new(LedgerFile::new(fx.layout.ledger_path())),
        );
        let cancel = CancellationToken::new();

        installer.install(&fx.spec("1.0.0"), &cancel).await.unwrap();
        let second = installer.install(&fx.spec("1.0.0"), &cancel).await.unwrap();

        assert!(second.skipped);
        assert_eq!(fetcher.fetches.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(installer.ledger().list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_replaces_contents_and_removes_backup() {
        let fx = Fixture::new();
        let installer = fx.installer();
        let cancel = CancellationToken::new();

        installer.install(&fx.spec("1.0.0"), &cancel).await.unwrap();
        let report = installer.install(&fx.spec("2.0.0"), &cancel).await.unwrap();

        assert_eq!(report.old_version.as_deref(), Some("1.0.0"));
        assert_eq!(report.to_string(), "agent:code-reviewer updated 1.0.0 -> 2.0.0");
        assert_eq!(fx.installed_content(), "version two");

        let entries: Vec<_> = fs::read_dir(fx.layout.kind_dir(ToolKind::Agent))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("code-reviewer")]);
    }

    #[tokio::test]
    async fn test_unknown_version_fails_at_resolving() {
        let fx = Fixture::new();
        let err = fx
            .installer()
            .install(&fx.spec("9.9.9"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), PackageErrorKind::NotFound);
        assert!(matches!(err.root(), PackageError::VersionNotFound { .. }));
        assert!(matches!(err, PackageError::Stage { stage: Stage::Resolving, .. }));
    }

    #[tokio::test]
    async fn test_extraction_failure_restores_previous_version() {
        let fx = Fixture::new();
        let cancel = CancellationToken::new();
        fx.installer().install(&fx.spec("1.0.0"), &cancel).await.unwrap();

        let mut extractor = MockArchiveExtractor::new();
        extractor.expect_hash().returning(|path| hash_file(path));
        extractor.expect_extract().returning(|_, destination, _| {
            fs::create_dir_all(destination).unwrap();
            fs::write(destination.join("agent.md"), "half").unwrap();
            Err(PackageError::io(
                destination,
                std::io::Error::new(std::io::ErrorKind::Other, "No space left on device"),
            ))
        });

        let installer = fx.installer_with(
            fx.catalog(),
            Arc::new(fx.fetcher()),
            Arc::new(extractor),
            Arc::new(LedgerFile::new(fx.layout.ledger_path())),
        );

        let err = installer.install(&fx.spec("2.0.0"), &cancel).await.unwrap_err();
        assert!(matches!(err, PackageError::Stage { stage: Stage::Extracting, .. }));

        assert_eq!(fx.installed_content(), "version one");
        let record = installer.ledger().get(&fx.identity).await.unwrap();
        assert_eq!(record.version, "1.0.0");
    }

    #[tokio::test]
    async fn test_ledger_failure_restores_previous_version() {
        let fx = Fixture::new();
        let cancel = CancellationToken::new();
        fx.installer().install(&fx.spec("1.0.0"), &cancel).await.unwrap();
        let committed = LedgerFile::new(fx.layout.ledger_path())
            .get(&fx.identity)
            .await
            .unwrap();

        let mut ledger = MockToolLedger::new();
        ledger
            .expect_get()
            .returning(move |_| Ok(committed.clone()));
        ledger.expect_add_or_update().returning(|_, _| {
            Err(PackageError::io(
                "/workspace/.agentpack.json",
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            ))
        });

        let installer = fx.installer_with(
            fx.catalog(),
            Arc::new(fx.fetcher()),
            Arc::new(SecureExtractor::new(fx.layout.root().to_path_buf(), SecurityLimits::default())),
            Arc::new(ledger),
        );

        let err = installer.install(&fx.spec("2.0.0"), &cancel).await.unwrap_err();
        assert_eq!(err.kind(), PackageErrorKind::PermissionDenied);
        assert!(matches!(
            err,
            PackageError::Stage { stage: Stage::CommittingLedger, .. }
        ));
        assert_eq!(fx.installed_content(), "version one");
    }

    #[tokio::test]
    async fn test_failed_fresh_install_leaves_nothing_behind() {
        let fx = Fixture::new();
        let mut extractor = MockArchiveExtractor::new();
        extractor.expect_hash().returning(|path| hash_file(path));
        extractor.expect_extract().returning(|_, destination, _| {
            fs::create_dir_all(destination).unwrap();
            Err(PackageError::Cancelled)
        });

        let installer = fx.installer_with(
            fx.catalog(),
            Arc::new(fx.fetcher()),
            Arc::new(extractor),
            Arc::new(LedgerFile::new(fx.layout.ledger_path())),
        );

        assert!(installer
            .install(&fx.spec("1.0.0"), &CancellationToken::new())
            .await
            .is_err());
        assert!(!fx.layout.tool_dir(&fx.identity).exists());
        assert!(!installer.is_installed(&fx.identity).await.unwrap());
    }

    #[tokio::test]
    async fn test_declared_hash_mismatch_blocks_extraction() {
        let fx = Fixture::new();
        let catalog = StaticCatalog::new(ORIGIN).with_version(
            fx.identity.clone(),
            VersionInfo::new("1.0.0", "mem://v1.zip").with_declared_hash("0".repeat(64)),
        );

        let mut extractor = MockArchiveExtractor::new();
        extractor.expect_hash().returning(|path| hash_file(path));
        extractor.expect_extract().never();

        let installer = fx.installer_with(
            catalog,
            Arc::new(fx.fetcher()),
            Arc::new(extractor),
            Arc::new(LedgerFile::new(fx.layout.ledger_path())),
        );

        let err = installer
            .install(&fx.spec("1.0.0"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), PackageErrorKind::IntegrityFailure);
        assert!(!fx.layout.tool_dir(&fx.identity).exists());
    }

    #[tokio::test]
    async fn test_cancelled_install_changes_nothing() {
        let fx = Fixture::new();
        let mut fetcher = MockArchiveFetcher::new();
        fetcher.expect_fetch().never();

        let installer = fx.installer_with(
            fx.catalog(),
            Arc::new(fetcher),
            Arc::new(SecureExtractor::new(fx.layout.root().to_path_buf(), SecurityLimits::default())),
            Arc::new(LedgerFile::new(fx.layout.ledger_path())),
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = installer.install(&fx.spec("1.0.0"), &cancel).await.unwrap_err();
        assert_eq!(err.kind(), PackageErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_install_multiple_is_best_effort() {
        let fx = Fixture::new();
        let installer = fx.installer();
        let specs = vec![
            ToolSpec::parse("agent:missing-tool", ToolKind::Agent).unwrap(),
            fx.spec("1.0.0"),
        ];

        let report = installer
            .install_multiple(&specs, &CancellationToken::new())
            .await;

        assert!(!report.is_success());
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, "agent:missing-tool");
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.changed(), 1);
        assert!(installer.is_installed(&fx.identity).await.unwrap());
    }

    #[tokio::test]
    async fn test_uninstall() {
        let fx = Fixture::new();
        let installer = fx.installer();
        installer
            .install(&fx.spec("1.0.0"), &CancellationToken::new())
            .await
            .unwrap();

        let record = installer.uninstall(&fx.identity).await.unwrap();
        assert_eq!(record.version, "1.0.0");
        assert!(!fx.layout.tool_dir(&fx.identity).exists());
        assert!(!installer.is_installed(&fx.identity).await.unwrap());

        let err = installer.uninstall(&fx.identity).await.unwrap_err();
        assert!(matches!(err, PackageError::NotInstalled(_)));
    }

    #[tokio::test]
    async fn test_verify_and_status() {
        let fx = Fixture::new();
        let installer = fx.installer();

        assert_eq!(installer.status(&fx.identity).await.unwrap(), ToolStatus::NotInstalled);
        assert!(installer.verify(&fx.identity).await.is_err());

        installer
            .install(&fx.spec("1.0.0"), &CancellationToken::new())
            .await
            .unwrap();
        let tool = installer.verify(&fx.identity).await.unwrap();
        assert_eq!(tool.path, fx.layout.tool_dir(&fx.identity));
        assert!(installer.status(&fx.identity).await.unwrap().is_ready());

        fs::remove_file(tool.path.join("agent.md")).unwrap();
        let err = installer.verify(&fx.identity).await.unwrap_err();
        assert_eq!(err.kind(), PackageErrorKind::StateCorruption);
        assert!(matches!(
            installer.status(&fx.identity).await.unwrap(),
            ToolStatus::Broken { .. }
        ));

        let listed = installer.list_installed().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].record.version, "1.0.0");
    }

    #[tokio::test]
    async fn test_reinstall_repairs_missing_directory() {
        let fx = Fixture::new();
        let installer = fx.installer();
        let cancel = CancellationToken::new();

        installer.install(&fx.spec("1.0.0"), &cancel).await.unwrap();
        fs::remove_dir_all(fx.layout.tool_dir(&fx.identity)).unwrap();

        let report = installer.install(&fx.spec("1.0.0"), &cancel).await.unwrap();
        assert!(!report.skipped);
        assert_eq!(fx.installed_content(), "version one");
    }

    #[tokio::test]
    async fn test_recover_restores_interrupted_update() {
        let fx = Fixture::new();
        let installer = fx.installer();
        installer
            .install(&fx.spec("1.0.0"), &CancellationToken::new())
            .await
            .unwrap();

        // Simulate a crash mid-extraction of an update
        let dest = fx.layout.tool_dir(&fx.identity);
        let backup = fx.layout.backup_path(&fx.identity);
        fs::rename(&dest, &backup).unwrap();
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("agent.md"), "partial").unwrap();

        assert_eq!(installer.recover().await.unwrap(), 1);
        assert_eq!(fx.installed_content(), "version one");
        assert!(!backup.exists());
    }

    #[tokio::test]
    async fn test_recover_removes_backup_of_committed_update() {
        let fx = Fixture::new();
        let installer = fx.installer();

        // Backup taken before the committed install
        let backup = fx.layout.backup_path(&fx.identity);
        fs::create_dir_all(&backup).unwrap();
        fs::write(backup.join("agent.md"), "old").unwrap();

        installer
            .install(&fx.spec("1.0.0"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(installer.recover().await.unwrap(), 1);
        assert!(!backup.exists());
        assert_eq!(fx.installed_content(), "version one");
    }

    #[tokio::test]
    async fn test_uninstall_after_interrupted_update_leaves_no_orphan() {
        let fx = Fixture::new();
        let installer = fx.installer();
        installer
            .install(&fx.spec("1.0.0"), &CancellationToken::new())
            .await
            .unwrap();

        // Crash mid-extraction of an update, then uninstall
        let dest = fx.layout.tool_dir(&fx.identity);
        let backup = fx.layout.backup_path(&fx.identity);
        fs::rename(&dest, &backup).unwrap();
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("agent.md"), "partial").unwrap();
        installer.uninstall(&fx.identity).await.unwrap();
        assert!(!backup.exists());

        assert_eq!(installer.recover().await.unwrap(), 0);
        assert!(!dest.exists());
        assert!(!installer.is_installed(&fx.identity).await.unwrap());
    }

    #[tokio::test]
    async fn test_recover_deletes_backup_without_ledger_record() {
        let fx = Fixture::new();
        let installer = fx.installer();

        let backup = fx.layout.backup_path(&fx.identity);
        fs::create_dir_all(&backup).unwrap();
        fs::write(backup.join("agent.md"), "old").unwrap();

        assert_eq!(installer.recover().await.unwrap(), 1);
        assert!(!backup.exists());
        assert!(!fx.layout.tool_dir(&fx.identity).exists());
        assert!(!installer.is_installed(&fx.identity).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_directory_removal_keeps_ledger_record() {
        let fx = Fixture::new();
        let identity = fx.identity.clone();

        // A regular file where the tool directory should be cannot be removed
        // as a directory
        let dest = fx.layout.tool_dir(&identity);
        fs::write(&dest, "not a directory").unwrap();

        let mut ledger = MockToolLedger::new();
        ledger
            .expect_get()
            .returning(move |id| Ok(InstalledRecord::new(id.kind, "1.0.0", "registry", "00")));
        ledger.expect_remove().never();

        let installer = fx.installer_with(
            fx.catalog(),
            Arc::new(fx.fetcher()),
            Arc::new(MockArchiveExtractor::new()),
            Arc::new(ledger),
        );

        let err = installer.uninstall(&identity).await.unwrap_err();
        assert!(matches!(err, PackageError::Io { .. }));
        assert!(dest.exists());
    }
}
