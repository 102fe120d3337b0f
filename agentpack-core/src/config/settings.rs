//! Package manager settings.
//!
//! Settings are stored as a JSON document. Every field has a default, so a
//! partial file (or no file at all) is valid.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::packages::downloader::{RetryPolicy, UrlPolicy};
use crate::packages::extractor::SecurityLimits;
use crate::packages::installer::DEFAULT_SOURCE_TAG;
use crate::packages::paths::{WorkspaceLayout, DEFAULT_LEDGER_FILE};
use crate::packages::types::{ToolKind, ToolSpec};
use crate::packages::PackageError;

// =============================================================================
// Settings
// =============================================================================

/// Package manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Workspace holding `agents/`, `commands/`, `skills/` and the ledger.
    pub workspace_root: PathBuf,

    /// Ledger file name inside the workspace root.
    pub ledger_file: String,

    /// Archive extraction limits.
    pub limits: SecurityLimits,

    /// Download retry and timeout policy.
    pub retry: RetryPolicy,

    /// Hosts archives may be downloaded from (subdomains included).
    pub allowed_hosts: Vec<String>,

    /// Only accept HTTPS download URLs.
    pub require_https: bool,

    /// Origin tag stored in ledger records.
    pub source_tag: String,

    /// Kind assumed for specifiers without a `kind:` prefix.
    pub default_kind: ToolKind,

    /// Report download progress.
    pub show_progress: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let url_policy = UrlPolicy::default();
        Self {
            workspace_root: PathBuf::from("."),
            ledger_file: DEFAULT_LEDGER_FILE.to_string(),
            limits: SecurityLimits::default(),
            retry: RetryPolicy::default(),
            allowed_hosts: url_policy.allowed_hosts,
            require_https: url_policy.require_https,
            source_tag: DEFAULT_SOURCE_TAG.to_string(),
            default_kind: ToolKind::Agent,
            show_progress: false,
        }
    }
}

impl Settings {
    /// Creates default settings for a workspace.
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: root.into(),
            ..Self::default()
        }
    }

    /// Load settings from a JSON file, using defaults for missing values.
    ///
    /// A missing file yields defaults; a malformed one is an error.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let json = match std::fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No settings at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };

        let mut settings: Settings = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse settings in {}", path.display()))?;
        settings.validate();
        Ok(settings)
    }

    /// Save settings as pretty-printed JSON.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Validate and clamp settings to valid ranges.
    pub fn validate(&mut self) {
        self.retry.max_attempts = self.retry.max_attempts.clamp(1, 10);
        self.retry.max_delay_ms = self.retry.max_delay_ms.max(self.retry.base_delay_ms);
        self.retry.timeout_secs = self.retry.timeout_secs.max(1);

        self.limits.max_compression_ratio = self.limits.max_compression_ratio.max(1);
        self.limits.max_single_entry_bytes = self
            .limits
            .max_single_entry_bytes
            .min(self.limits.max_total_uncompressed_bytes);

        if self.ledger_file.trim().is_empty() {
            self.ledger_file = DEFAULT_LEDGER_FILE.to_string();
        }
        if self.source_tag.trim().is_empty() {
            self.source_tag = DEFAULT_SOURCE_TAG.to_string();
        }
    }

    /// Workspace layout described by these settings.
    pub fn layout(&self) -> WorkspaceLayout {
        WorkspaceLayout::new(self.workspace_root.clone()).with_ledger_file(self.ledger_file.clone())
    }

    /// Download URL policy described by these settings.
    pub fn url_policy(&self) -> UrlPolicy {
        UrlPolicy {
            allowed_hosts: self.allowed_hosts.clone(),
            require_https: self.require_https,
        }
    }

    /// Parses a tool specifier using the configured default kind.
    pub fn parse_spec(&self, input: &str) -> Result<ToolSpec, PackageError> {
        ToolSpec::parse(input, self.default_kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.ledger_file, ".agentpack.json");
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.retry.base_delay_ms, 1_000);
        assert_eq!(settings.retry.max_delay_ms, 30_000);
        assert_eq!(settings.retry.timeout_secs, 600);
        assert_eq!(settings.allowed_hosts, vec!["github.com", "githubusercontent.com"]);
        assert_eq!(settings.source_tag, "registry");
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let settings = Settings::load_from(&temp_dir.path().join("nope.json")).unwrap();
        assert_eq!(settings.default_kind, ToolKind::Agent);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"workspace_root": "/srv/tools", "retry": {"max_attempts": 0}, "default_kind": "skill"}"#,
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.workspace_root, PathBuf::from("/srv/tools"));
        assert_eq!(settings.retry.max_attempts, 1);
        assert_eq!(settings.retry.timeout_secs, 600);
        assert_eq!(settings.default_kind, ToolKind::Skill);
        assert_eq!(
            settings.layout().ledger_path(),
            PathBuf::from("/srv/tools/.agentpack.json")
        );

        let spec = settings.parse_spec("pdf@1.0.0").unwrap();
        assert_eq!(spec.to_string(), "skill:pdf@1.0.0");
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(Settings::load_from(&path).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");

        let mut settings = Settings::for_workspace(temp_dir.path());
        settings.allowed_hosts.push("example.org".to_string());
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded.workspace_root, temp_dir.path());
        assert_eq!(loaded.allowed_hosts.len(), 3);
        assert!(loaded.url_policy().validate("https://example.org/a.zip").is_ok());
    }
}
