//! Core types for tool bundle management.
//!
//! This module defines the foundational types used across the package
//! manager: tool kinds and identities, install specifiers, ledger records,
//! tool status and the reports returned by orchestrated operations.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;

use super::error::PackageError;

// ============================================================================
// Tool Kinds
// ============================================================================

/// The category of an installable tool bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    /// A sub-agent definition.
    Agent,
    /// A slash command.
    Command,
    /// A skill bundle.
    Skill,
}

impl ToolKind {
    /// Returns all tool kinds.
    pub fn all() -> &'static [ToolKind] {
        &[Self::Agent, Self::Command, Self::Skill]
    }

    /// Returns the lowercase string identifier for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Command => "command",
            Self::Skill => "skill",
        }
    }

    /// Returns the workspace directory name holding tools of this kind.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Agent => "agents",
            Self::Command => "commands",
            Self::Skill => "skills",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ToolKind {
    type Err = PackageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "agent" | "agents" => Ok(Self::Agent),
            "command" | "commands" | "cmd" => Ok(Self::Command),
            "skill" | "skills" => Ok(Self::Skill),
            _ => Err(PackageError::InvalidSpec {
                input: s.to_string(),
                reason: "unknown tool kind (expected agent, command or skill)".to_string(),
            }),
        }
    }
}

// ============================================================================
// Tool Identity
// ============================================================================

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("tool name pattern is valid")
    })
}

/// Validates a tool name before it is used as a path component.
pub fn validate_name(name: &str) -> Result<(), PackageError> {
    if name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(PackageError::InvalidSpec {
            input: name.to_string(),
            reason: "tool names must start with a letter or digit and contain only letters, \
                     digits, '.', '_' or '-'"
                .to_string(),
        })
    }
}

/// The `(kind, name)` pair that uniquely names a tool within a workspace.
///
/// Serialized as the compound key `"kind:name"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ToolIdentity {
    pub kind: ToolKind,
    pub name: String,
}

impl ToolIdentity {
    /// Creates an identity, validating the name.
    pub fn new(kind: ToolKind, name: impl Into<String>) -> Result<Self, PackageError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self { kind, name })
    }

    /// Shorthand for an agent identity.
    pub fn agent(name: impl Into<String>) -> Result<Self, PackageError> {
        Self::new(ToolKind::Agent, name)
    }

    /// Shorthand for a command identity.
    pub fn command(name: impl Into<String>) -> Result<Self, PackageError> {
        Self::new(ToolKind::Command, name)
    }

    /// Shorthand for a skill identity.
    pub fn skill(name: impl Into<String>) -> Result<Self, PackageError> {
        Self::new(ToolKind::Skill, name)
    }
}

impl fmt::Display for ToolIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

impl std::str::FromStr for ToolIdentity {
    type Err = PackageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = s.split_once(':').ok_or_else(|| PackageError::InvalidSpec {
            input: s.to_string(),
            reason: "expected 'kind:name'".to_string(),
        })?;
        Self::new(kind.parse()?, name)
    }
}

impl TryFrom<String> for ToolIdentity {
    type Error = PackageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ToolIdentity> for String {
    fn from(identity: ToolIdentity) -> Self {
        identity.to_string()
    }
}

// ============================================================================
// Install Specifiers
// ============================================================================

/// A tool requested for installation: identity plus optional version.
///
/// Accepted forms are `name`, `name@version`, `kind:name` and
/// `kind:name@version`. When the kind prefix is omitted the caller's default
/// kind applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSpec {
    pub identity: ToolIdentity,
    pub version: Option<String>,
}

impl ToolSpec {
    /// Creates a spec from an identity and an optional version.
    pub fn new(identity: ToolIdentity, version: Option<String>) -> Self {
        Self { identity, version }
    }

    /// Parses a specifier string.
    pub fn parse(input: &str, default_kind: ToolKind) -> Result<Self, PackageError> {
        let trimmed = input.trim();
        let (target, version) = match trimmed.split_once('@') {
            Some((target, version)) => {
                let version = version.trim();
                if version.is_empty() {
                    return Err(PackageError::InvalidSpec {
                        input: input.to_string(),
                        reason: "empty version after '@'".to_string(),
                    });
                }
                (target, Some(version.to_string()))
            }
            None => (trimmed, None),
        };

        let identity = match target.split_once(':') {
            Some((kind, name)) => ToolIdentity::new(kind.parse()?, name)?,
            None => ToolIdentity::new(default_kind, target)?,
        };

        Ok(Self { identity, version })
    }
}

impl fmt::Display for ToolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}@{}", self.identity, version),
            None => write!(f, "{}", self.identity),
        }
    }
}

// ============================================================================
// Ledger Records
// ============================================================================

/// A single installed tool as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledRecord {
    /// Installed version string.
    pub version: String,
    /// Tool kind (duplicated from the key for readability of the ledger file).
    pub kind: ToolKind,
    /// When the tool was installed.
    pub installed_at: DateTime<Utc>,
    /// Origin tag, e.g. "registry".
    pub source: String,
    /// Lowercase hex SHA-256 of the installed archive.
    pub integrity: String,
}

impl InstalledRecord {
    /// Creates a record stamped with the current time.
    pub fn new(
        kind: ToolKind,
        version: impl Into<String>,
        source: impl Into<String>,
        integrity: impl Into<String>,
    ) -> Self {
        Self {
            version: version.into(),
            kind,
            installed_at: Utc::now(),
            source: source.into(),
            integrity: integrity.into(),
        }
    }

    /// Checks that the record is well-formed on its own.
    pub fn validate(&self) -> Result<(), String> {
        if self.version.trim().is_empty() {
            return Err("version is empty".to_string());
        }
        if self.source.trim().is_empty() {
            return Err("source is empty".to_string());
        }
        if self.integrity.len() != 64 || !self.integrity.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!(
                "integrity '{}' is not a hex SHA-256 digest",
                self.integrity
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Tool Status
// ============================================================================

/// Current installation status of a tool in the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolStatus {
    /// Tool has no ledger entry.
    NotInstalled,
    /// Tool is recorded and present on disk.
    Installed {
        /// Installed version string.
        version: String,
    },
    /// Tool is recorded but its directory is missing or empty.
    Broken {
        /// Recorded version string.
        version: String,
        /// What is wrong with the on-disk state.
        reason: String,
    },
}

impl ToolStatus {
    /// Returns true if the tool is ready to use.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Installed { .. })
    }
}

/// A ledger record joined with its on-disk location.
#[derive(Debug, Clone)]
pub struct InstalledTool {
    pub identity: ToolIdentity,
    pub record: InstalledRecord,
    pub path: PathBuf,
}

// ============================================================================
// Operation Reports
// ============================================================================

/// Result of a single install or update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub identity: ToolIdentity,
    /// Version installed before the operation, if any.
    pub old_version: Option<String>,
    /// Version installed after the operation.
    pub new_version: String,
    /// True when nothing changed because the requested version was already present.
    pub skipped: bool,
    /// Integrity of the installed archive (None when skipped).
    pub integrity: Option<String>,
}

impl fmt::Display for InstallReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.skipped {
            return write!(
                f,
                "{} is already at {}, skipped",
                self.identity, self.new_version
            );
        }
        match &self.old_version {
            Some(old) => write!(
                f,
                "{} updated {} -> {}",
                self.identity, old, self.new_version
            ),
            None => write!(f, "{} installed at {}", self.identity, self.new_version),
        }
    }
}

/// Aggregated result of a best-effort batch operation.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Successful (including skipped) operations, in request order.
    pub results: Vec<InstallReport>,
    /// Failed operations with the label of the request that failed.
    pub errors: Vec<(String, PackageError)>,
}

impl BatchReport {
    /// Returns true if every operation succeeded.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of operations that changed the workspace.
    pub fn changed(&self) -> usize {
        self.results.iter().filter(|r| !r.skipped).count()
    }
}

/// A tool whose installed version is older than the catalog's latest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutdatedEntry {
    pub identity: ToolIdentity,
    pub current: String,
    pub latest: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("agent".parse::<ToolKind>().unwrap(), ToolKind::Agent);
        assert_eq!("Commands".parse::<ToolKind>().unwrap(), ToolKind::Command);
        assert_eq!("skill".parse::<ToolKind>().unwrap(), ToolKind::Skill);
        assert!("plugin".parse::<ToolKind>().is_err());
    }

    #[test]
    fn test_identity_roundtrip_through_string() {
        let identity = ToolIdentity::agent("code-reviewer").unwrap();
        assert_eq!(identity.to_string(), "agent:code-reviewer");
        assert_eq!(
            "agent:code-reviewer".parse::<ToolIdentity>().unwrap(),
            identity
        );
    }

    #[test]
    fn test_identity_rejects_path_like_names() {
        assert!(ToolIdentity::agent("../etc").is_err());
        assert!(ToolIdentity::agent("a/b").is_err());
        assert!(ToolIdentity::agent(".hidden").is_err());
        assert!(ToolIdentity::agent("").is_err());
        assert!(ToolIdentity::agent("ok_name-1.2").is_ok());
    }

    #[test]
    fn test_same_name_different_kinds_are_distinct() {
        let agent = ToolIdentity::agent("deploy").unwrap();
        let command = ToolIdentity::command("deploy").unwrap();
        assert_ne!(agent, command);
    }

    #[test]
    fn test_spec_parsing() {
        let spec = ToolSpec::parse("code-reviewer", ToolKind::Agent).unwrap();
        assert_eq!(spec.identity, ToolIdentity::agent("code-reviewer").unwrap());
        assert_eq!(spec.version, None);

        let spec = ToolSpec::parse("skill:pdf@1.2.0", ToolKind::Agent).unwrap();
        assert_eq!(spec.identity, ToolIdentity::skill("pdf").unwrap());
        assert_eq!(spec.version.as_deref(), Some("1.2.0"));

        assert!(ToolSpec::parse("pdf@", ToolKind::Skill).is_err());
        assert!(ToolSpec::parse("widget:pdf", ToolKind::Skill).is_err());
    }

    #[test]
    fn test_record_validation() {
        let good = InstalledRecord::new(ToolKind::Agent, "1.0.0", "registry", "a".repeat(64));
        assert!(good.validate().is_ok());

        let mut bad = good.clone();
        bad.version = String::new();
        assert!(bad.validate().is_err());

        let mut bad = good;
        bad.integrity = "xyz".to_string();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_report_display() {
        let identity = ToolIdentity::agent("x").unwrap();
        let report = InstallReport {
            identity,
            old_version: Some("1.0.0".to_string()),
            new_version: "2.0.0".to_string(),
            skipped: false,
            integrity: None,
        };
        assert_eq!(report.to_string(), "agent:x updated 1.0.0 -> 2.0.0");
    }
}
