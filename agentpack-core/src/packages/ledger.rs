//! Installed tool ledger persistence.
//!
//! The ledger is a single JSON document at the workspace root that records
//! every installed tool, its version, origin and archive integrity.
//!
//! Writes never modify the file in place: the whole document is serialized to
//! a temporary file in the same directory, synced, and renamed over the
//! target. Every mutation is a read-modify-write transaction that reloads the
//! file under an exclusive lock, so concurrent writers serialize instead of
//! overwriting each other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use super::error::PackageError;
use super::types::{InstalledRecord, ToolIdentity};

/// Current schema version for the ledger file.
pub const LEDGER_SCHEMA_VERSION: u32 = 1;

// ============================================================================
// Ledger Document
// ============================================================================

/// Root structure of the ledger file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    /// Schema version for forward compatibility.
    pub schema_version: u32,
    /// When the ledger was last written.
    pub updated_at: DateTime<Utc>,
    /// Catalog the installed tools came from; unset until the first install.
    #[serde(default)]
    pub registry_origin: Option<String>,
    /// Installed tools keyed by `"kind:name"`.
    #[serde(default)]
    pub tools: BTreeMap<ToolIdentity, InstalledRecord>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self {
            schema_version: LEDGER_SCHEMA_VERSION,
            updated_at: Utc::now(),
            registry_origin: None,
            tools: BTreeMap::new(),
        }
    }
}

impl Ledger {
    /// Creates a new empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks if a tool is installed.
    pub fn is_installed(&self, identity: &ToolIdentity) -> bool {
        self.tools.contains_key(identity)
    }

    /// Gets the record for a tool.
    pub fn get(&self, identity: &ToolIdentity) -> Option<&InstalledRecord> {
        self.tools.get(identity)
    }

    /// Records a tool as installed, replacing any previous record.
    pub fn insert(&mut self, identity: ToolIdentity, record: InstalledRecord) {
        self.tools.insert(identity, record);
    }

    /// Removes a tool, returning its record.
    pub fn remove(&mut self, identity: &ToolIdentity) -> Option<InstalledRecord> {
        self.tools.remove(identity)
    }

    /// Number of installed tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns true if nothing is installed.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Checks the whole document before it is persisted.
    pub fn validate(&self) -> Result<(), String> {
        if self.schema_version == 0 {
            return Err("schema_version is not set".to_string());
        }

        for (identity, record) in &self.tools {
            if record.kind != identity.kind {
                return Err(format!(
                    "{} is recorded with mismatching kind '{}'",
                    identity, record.kind
                ));
            }
            record
                .validate()
                .map_err(|reason| format!("{}: {}", identity, reason))?;
        }

        Ok(())
    }
}

// ============================================================================
// Ledger Persistence
// ============================================================================

/// Loads the ledger from `path`.
///
/// A missing file yields a fresh empty ledger. A file that exists but cannot
/// be parsed is reported as corrupt; it is never repaired automatically.
pub fn load_ledger_from(path: &Path) -> Result<Ledger, PackageError> {
    if !path.exists() {
        debug!("Ledger not found at {}, starting empty", path.display());
        return Ok(Ledger::new());
    }

    let content = fs::read_to_string(path).map_err(|e| PackageError::io(path, e))?;

    let mut ledger: Ledger =
        serde_json::from_str(&content).map_err(|e| PackageError::LedgerCorrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    if ledger.schema_version == 0 || ledger.schema_version > LEDGER_SCHEMA_VERSION {
        return Err(PackageError::LedgerCorrupt {
            path: path.to_path_buf(),
            message: format!(
                "unsupported schema_version {} (this build understands up to {})",
                ledger.schema_version, LEDGER_SCHEMA_VERSION
            ),
        });
    }
    if ledger.schema_version != LEDGER_SCHEMA_VERSION {
        info!(
            "Ledger schema version {} differs from current {}, migrating",
            ledger.schema_version, LEDGER_SCHEMA_VERSION
        );
        ledger.schema_version = LEDGER_SCHEMA_VERSION;
    }

    Ok(ledger)
}

/// Validates and atomically writes the ledger to `path`.
///
/// The document goes to a temporary file in the same directory, is synced,
/// and then renamed over `path`. If anything fails before the rename the
/// temporary file is removed and `path` is untouched.
pub fn save_ledger_to(ledger: &Ledger, path: &Path) -> Result<(), PackageError> {
    ledger.validate().map_err(PackageError::InvalidLedger)?;

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(|e| PackageError::io(&parent, e))?;

    let content = serde_json::to_vec_pretty(ledger)
        .map_err(|e| PackageError::InvalidLedger(e.to_string()))?;

    // Dropping the NamedTempFile on any early return deletes it
    let mut temp = tempfile::Builder::new()
        .prefix(".ledger-")
        .suffix(".tmp")
        .tempfile_in(&parent)
        .map_err(|e| PackageError::io(&parent, e))?;
    temp.write_all(&content)
        .map_err(|e| PackageError::io(temp.path(), e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| PackageError::io(temp.path(), e))?;
    temp.persist(path)
        .map_err(|e| PackageError::io(path, e.error))?;

    #[cfg(unix)]
    if let Ok(dir) = File::open(&parent) {
        let _ = dir.sync_all();
    }

    debug!("Ledger saved to {}", path.display());
    Ok(())
}

// ============================================================================
// Ledger Capability
// ============================================================================

/// Ledger reads and writes as consumed by the orchestrators.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ToolLedger: Send + Sync {
    /// Reads the whole ledger.
    async fn load(&self) -> Result<Ledger, PackageError>;

    /// Replaces the whole ledger.
    async fn save(&self, ledger: &Ledger) -> Result<(), PackageError>;

    /// Inserts or replaces one record.
    async fn add_or_update(
        &self,
        identity: &ToolIdentity,
        record: InstalledRecord,
    ) -> Result<(), PackageError>;

    /// Removes one record, failing with `NotInstalled` if absent.
    async fn remove(&self, identity: &ToolIdentity) -> Result<InstalledRecord, PackageError>;

    /// Gets one record, failing with `NotInstalled` if absent.
    async fn get(&self, identity: &ToolIdentity) -> Result<InstalledRecord, PackageError>;

    /// Lists every record.
    async fn list(&self) -> Result<BTreeMap<ToolIdentity, InstalledRecord>, PackageError>;

    /// Checks whether a record exists.
    async fn is_installed(&self, identity: &ToolIdentity) -> Result<bool, PackageError>;

    /// Records the catalog origin.
    async fn set_origin(&self, url: &str) -> Result<(), PackageError>;

    /// Returns the recorded catalog origin.
    async fn origin(&self) -> Result<Option<String>, PackageError>;
}

// ============================================================================
// File-backed Ledger
// ============================================================================

/// Handle on one ledger file.
///
/// An in-process reader/writer lock lets reads run concurrently while writes
/// are exclusive. An advisory lock on `<ledger>.lock` extends the same
/// discipline to other processes sharing the workspace.
pub struct LedgerFile {
    path: PathBuf,
    lock_path: PathBuf,
    lock: RwLock<()>,
}

impl LedgerFile {
    /// Creates a handle for the ledger at `path`. Nothing is read yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "ledger".into());
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);

        Self {
            path,
            lock_path,
            lock: RwLock::new(()),
        }
    }

    /// Returns the ledger file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Takes the exclusive cross-process lock. Released when the returned file
    /// drops.
    fn lock_exclusive(&self) -> Result<File, PackageError> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent).map_err(|e| PackageError::io(parent, e))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| PackageError::io(&self.lock_path, e))?;
        FileExt::lock_exclusive(&file).map_err(|e| PackageError::io(&self.lock_path, e))?;

        Ok(file)
    }

    /// Takes the shared cross-process lock.
    ///
    /// An existing lock file is opened read-only. Returns None when the lock
    /// file is missing and cannot be created (a read-only workspace), in which
    /// case the caller reads unlocked.
    fn lock_shared(&self) -> Result<Option<File>, PackageError> {
        let file = match File::open(&self.lock_path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let created = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&self.lock_path);
                match created {
                    Ok(file) => file,
                    Err(e) => {
                        debug!(
                            "Cannot create {}, reading ledger unlocked: {}",
                            self.lock_path.display(),
                            e
                        );
                        return Ok(None);
                    }
                }
            }
            Err(e) => return Err(PackageError::io(&self.lock_path, e)),
        };

        FileExt::lock_shared(&file).map_err(|e| PackageError::io(&self.lock_path, e))?;
        Ok(Some(file))
    }

    /// Runs `f` against the current on-disk ledger under a shared lock.
    async fn read<T>(&self, f: impl FnOnce(Ledger) -> T) -> Result<T, PackageError> {
        let _guard = self.lock.read().await;

        // A workspace that was never written has nothing to lock
        let has_parent = self.path.parent().map_or(true, |p| p.as_os_str().is_empty() || p.exists());
        if !has_parent {
            return Ok(f(Ledger::new()));
        }

        let _file_lock = self.lock_shared()?;
        let ledger = load_ledger_from(&self.path)?;
        Ok(f(ledger))
    }

    /// Reloads, mutates and saves the ledger under an exclusive lock.
    async fn transact<T>(
        &self,
        f: impl FnOnce(&mut Ledger) -> Result<T, PackageError>,
    ) -> Result<T, PackageError> {
        let _guard = self.lock.write().await;
        let _file_lock = self.lock_exclusive()?;

        let mut ledger = load_ledger_from(&self.path)?;
        let value = f(&mut ledger)?;
        ledger.updated_at = Utc::now();
        save_ledger_to(&ledger, &self.path)?;
        Ok(value)
    }
}

#[async_trait]
impl ToolLedger for LedgerFile {
    async fn load(&self) -> Result<Ledger, PackageError> {
        self.read(|ledger| ledger).await
    }

    async fn save(&self, ledger: &Ledger) -> Result<(), PackageError> {
        let _guard = self.lock.write().await;
        let _file_lock = self.lock_exclusive()?;
        save_ledger_to(ledger, &self.path)
    }

    async fn add_or_update(
        &self,
        identity: &ToolIdentity,
        record: InstalledRecord,
    ) -> Result<(), PackageError> {
        self.transact(|ledger| {
            ledger.insert(identity.clone(), record);
            Ok(())
        })
        .await?;
        debug!(tool = %identity, "Ledger record written");
        Ok(())
    }

    async fn remove(&self, identity: &ToolIdentity) -> Result<InstalledRecord, PackageError> {
        let record = self
            .transact(|ledger| {
                ledger
                    .remove(identity)
                    .ok_or_else(|| PackageError::NotInstalled(identity.clone()))
            })
            .await?;
        debug!(tool = %identity, "Ledger record removed");
        Ok(record)
    }

    async fn get(&self, identity: &ToolIdentity) -> Result<InstalledRecord, PackageError> {
        self.read(|ledger| ledger.get(identity).cloned())
            .await?
            .ok_or_else(|| PackageError::NotInstalled(identity.clone()))
    }

    async fn list(&self) -> Result<BTreeMap<ToolIdentity, InstalledRecord>, PackageError> {
        self.read(|ledger| ledger.tools).await
    }

    async fn is_installed(&self, identity: &ToolIdentity) -> Result<bool, PackageError> {
        self.read(|ledger| ledger.is_installed(identity)).await
    }

    async fn set_origin(&self, url: &str) -> Result<(), PackageError> {
        self.transact(|ledger| {
            ledger.registry_origin = Some(url.to_string());
            Ok(())
        })
        .await
    }

    async fn origin(&self) -> Result<Option<String>, PackageError> {
        self.read(|ledger| ledger.registry_origin).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::types::ToolKind;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn record(kind: ToolKind, version: &str) -> InstalledRecord {
        InstalledRecord::new(kind, version, "registry", "ab".repeat(32))
    }

    fn count_files(dir: &Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_ledger_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ledger.json");

        let mut ledger = Ledger::new();
        let identity = ToolIdentity::agent("code-reviewer").unwrap();
        ledger.insert(identity.clone(), record(ToolKind::Agent, "1.0.0"));
        ledger.registry_origin = Some("https://github.com/acme/tools".to_string());
        save_ledger_to(&ledger, &path).unwrap();

        let loaded = load_ledger_from(&path).unwrap();
        assert_eq!(loaded.schema_version, LEDGER_SCHEMA_VERSION);
        assert_eq!(loaded.get(&identity).unwrap().version, "1.0.0");
        assert_eq!(
            loaded.registry_origin.as_deref(),
            Some("https://github.com/acme/tools")
        );
    }

    #[test]
    fn test_ledger_json_format() {
        let mut ledger = Ledger::new();
        ledger.insert(
            ToolIdentity::skill("pdf").unwrap(),
            record(ToolKind::Skill, "2.1.0"),
        );
        let json = serde_json::to_string_pretty(&ledger).unwrap();

        assert!(json.contains("schema_version"));
        assert!(json.contains("updated_at"));
        assert!(json.contains("registry_origin"));
        assert!(json.contains("\"skill:pdf\""));
        assert!(json.contains("integrity"));
    }

    #[test]
    fn test_missing_file_returns_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nonexistent").join("ledger.json");

        let ledger = load_ledger_from(&path).unwrap();
        assert!(ledger.is_empty());
        assert_eq!(ledger.schema_version, LEDGER_SCHEMA_VERSION);
        assert!(ledger.registry_origin.is_none());
    }

    #[test]
    fn test_corrupted_file_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ledger.json");
        fs::write(&path, "not valid json {{{{").unwrap();

        let err = load_ledger_from(&path).unwrap_err();
        assert!(matches!(err, PackageError::LedgerCorrupt { .. }));
        // The file is left alone for inspection
        assert_eq!(fs::read_to_string(&path).unwrap(), "not valid json {{{{");
    }

    #[test]
    fn test_null_tools_is_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ledger.json");
        fs::write(
            &path,
            r#"{"schema_version":1,"updated_at":"2024-01-01T00:00:00Z","tools":null}"#,
        )
        .unwrap();

        assert!(matches!(
            load_ledger_from(&path),
            Err(PackageError::LedgerCorrupt { .. })
        ));
    }

    #[test]
    fn test_invalid_ledger_is_not_written() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ledger.json");

        let mut good = Ledger::new();
        good.insert(
            ToolIdentity::agent("a").unwrap(),
            record(ToolKind::Agent, "1.0.0"),
        );
        save_ledger_to(&good, &path).unwrap();
        let before = fs::read_to_string(&path).unwrap();

        let mut bad = good.clone();
        bad.schema_version = 0;
        assert!(matches!(
            save_ledger_to(&bad, &path),
            Err(PackageError::InvalidLedger(_))
        ));

        let mut bad = good;
        bad.insert(
            ToolIdentity::agent("b").unwrap(),
            record(ToolKind::Skill, "1.0.0"),
        );
        assert!(save_ledger_to(&bad, &path).is_err());

        assert_eq!(fs::read_to_string(&path).unwrap(), before);
        assert_eq!(count_files(temp_dir.path()), 1, "no temp files left behind");
    }

    #[test]
    fn test_interrupted_write_leaves_previous_document() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ledger.json");

        let mut ledger = Ledger::new();
        ledger.insert(
            ToolIdentity::agent("a").unwrap(),
            record(ToolKind::Agent, "1.0.0"),
        );
        save_ledger_to(&ledger, &path).unwrap();

        // A crash after the temp write but before the rename leaves a stray temp file
        let (mut stray, _) = tempfile::Builder::new()
            .prefix(".ledger-")
            .suffix(".tmp")
            .tempfile_in(temp_dir.path())
            .unwrap()
            .keep()
            .unwrap();
        stray.write_all(b"{\"schema_version\": 1, \"tools\": {\"agent:a\"").unwrap();

        let loaded = load_ledger_from(&path).unwrap();
        assert_eq!(loaded, ledger);
    }

    #[tokio::test]
    async fn test_get_and_remove_missing_are_not_installed() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = LedgerFile::new(temp_dir.path().join("ledger.json"));
        let identity = ToolIdentity::agent("ghost").unwrap();

        assert!(matches!(
            ledger.get(&identity).await,
            Err(PackageError::NotInstalled(_))
        ));
        assert!(matches!(
            ledger.remove(&identity).await,
            Err(PackageError::NotInstalled(_))
        ));
        assert!(!ledger.is_installed(&identity).await.unwrap());
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = LedgerFile::new(temp_dir.path().join("ledger.json"));
        let identity = ToolIdentity::command("deploy").unwrap();

        ledger
            .add_or_update(&identity, record(ToolKind::Command, "1.0.0"))
            .await
            .unwrap();
        assert!(ledger.is_installed(&identity).await.unwrap());

        ledger
            .add_or_update(&identity, record(ToolKind::Command, "1.1.0"))
            .await
            .unwrap();
        assert_eq!(ledger.get(&identity).await.unwrap().version, "1.1.0");
        assert_eq!(ledger.list().await.unwrap().len(), 1);

        let removed = ledger.remove(&identity).await.unwrap();
        assert_eq!(removed.version, "1.1.0");
        assert!(ledger.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_origin() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = LedgerFile::new(temp_dir.path().join("ledger.json"));

        assert_eq!(ledger.origin().await.unwrap(), None);
        ledger
            .set_origin("https://github.com/acme/tools")
            .await
            .unwrap();
        assert_eq!(
            ledger.origin().await.unwrap().as_deref(),
            Some("https://github.com/acme/tools")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_lose_no_updates() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = Arc::new(LedgerFile::new(temp_dir.path().join("ledger.json")));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                tokio::spawn(async move {
                    let identity = ToolIdentity::agent(format!("tool-{}", i)).unwrap();
                    ledger
                        .add_or_update(&identity, record(ToolKind::Agent, "1.0.0"))
                        .await
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(ledger.list().await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_writes_reload_state_written_by_another_handle() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ledger.json");
        let first = LedgerFile::new(&path);
        let second = LedgerFile::new(&path);

        first
            .add_or_update(
                &ToolIdentity::agent("a").unwrap(),
                record(ToolKind::Agent, "1.0.0"),
            )
            .await
            .unwrap();
        second
            .add_or_update(
                &ToolIdentity::skill("b").unwrap(),
                record(ToolKind::Skill, "1.0.0"),
            )
            .await
            .unwrap();

        assert_eq!(first.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_ledger_blocks_writes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ledger.json");
        fs::write(&path, "[]").unwrap();
        let ledger = LedgerFile::new(&path);

        let err = ledger
            .add_or_update(
                &ToolIdentity::agent("a").unwrap(),
                record(ToolKind::Agent, "1.0.0"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PackageError::LedgerCorrupt { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "[]");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reads_work_in_read_only_workspace() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let workspace = temp_dir.path().join("workspace");
        let ledger = LedgerFile::new(workspace.join("ledger.json"));
        let identity = ToolIdentity::agent("reader").unwrap();
        ledger
            .add_or_update(&identity, record(ToolKind::Agent, "1.0.0"))
            .await
            .unwrap();

        // Existing lock file without write permission
        let lock_path = workspace.join("ledger.json.lock");
        fs::set_permissions(&lock_path, fs::Permissions::from_mode(0o444)).unwrap();
        assert!(ledger.is_installed(&identity).await.unwrap());

        // No lock file and a directory that refuses new files
        fs::remove_file(&lock_path).unwrap();
        fs::set_permissions(&workspace, fs::Permissions::from_mode(0o555)).unwrap();
        let listed = ledger.list().await;
        let got = ledger.get(&identity).await;
        fs::set_permissions(&workspace, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(listed.unwrap().len(), 1);
        assert_eq!(got.unwrap().version, "1.0.0");
    }
}
