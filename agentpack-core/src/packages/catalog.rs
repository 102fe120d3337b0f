//! Tool catalog access.
//!
//! The installer only needs two things from a catalog: the archive location
//! for a given tool version (plus the latest version), and the origin URL to
//! record in the ledger. [`CatalogClient`] captures exactly that, so the
//! network-backed client lives outside this crate.
//!
//! [`StaticCatalog`] is an in-memory implementation built from explicit
//! definitions or a JSON index. It backs offline mirrors and tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::cmp::Ordering;
use tokio::sync::RwLock;

use super::error::PackageError;
use super::types::ToolIdentity;
use super::version::{compare_versions, Version};

// ============================================================================
// Catalog Types
// ============================================================================

/// One published version of a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Version string.
    pub version: String,
    /// Location of the archive, handed to the fetcher as-is.
    pub archive_url: String,
    /// Archive size in bytes as published (0 if unknown).
    #[serde(default)]
    pub size: u64,
    /// SHA-256 published alongside the archive, if any.
    #[serde(default)]
    pub declared_hash: Option<String>,
}

impl VersionInfo {
    /// Creates version info without a size or declared hash.
    pub fn new(version: impl Into<String>, archive_url: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            archive_url: archive_url.into(),
            size: 0,
            declared_hash: None,
        }
    }

    /// Sets the published archive size.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Sets the published SHA-256.
    pub fn with_declared_hash(mut self, hash: impl Into<String>) -> Self {
        self.declared_hash = Some(hash.into());
        self
    }
}

/// A resolved catalog lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTool {
    pub identity: ToolIdentity,
    /// The requested version, or the latest if none was requested.
    pub version: VersionInfo,
    /// Latest published version of the tool.
    pub latest_version: String,
}

// ============================================================================
// Catalog Capability
// ============================================================================

/// Catalog lookups as consumed by the orchestrators.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Resolves a tool version. `None` selects the latest version.
    ///
    /// # Errors
    ///
    /// `ToolNotFound` if the tool is unknown, `VersionNotFound` if the
    /// requested version is not published.
    async fn get_tool_version(
        &self,
        identity: &ToolIdentity,
        version: Option<&str>,
    ) -> Result<ResolvedTool, PackageError>;

    /// Returns the catalog's origin URL.
    async fn registry_origin(&self) -> Result<String, PackageError>;
}

// ============================================================================
// Static Catalog
// ============================================================================

/// JSON index format accepted by [`StaticCatalog::from_index_json`].
#[derive(Debug, Deserialize)]
struct CatalogIndex {
    origin: String,
    #[serde(default)]
    tools: BTreeMap<ToolIdentity, Vec<VersionInfo>>,
}

/// In-memory catalog with explicitly published versions.
pub struct StaticCatalog {
    origin: String,
    tools: RwLock<BTreeMap<ToolIdentity, Vec<VersionInfo>>>,
}

impl StaticCatalog {
    /// Creates an empty catalog.
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            tools: RwLock::new(BTreeMap::new()),
        }
    }

    /// Parses a JSON index of the form
    /// `{"origin": "...", "tools": {"agent:name": [VersionInfo, ...]}}`.
    pub fn from_index_json(json: &str) -> Result<Self, PackageError> {
        let index: CatalogIndex =
            serde_json::from_str(json).map_err(|e| PackageError::InvalidSpec {
                input: "catalog index".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            origin: index.origin,
            tools: RwLock::new(index.tools),
        })
    }

    /// Adds a version while building the catalog.
    pub fn with_version(mut self, identity: ToolIdentity, info: VersionInfo) -> Self {
        insert_version(self.tools.get_mut(), identity, info);
        self
    }

    /// Publishes a version at runtime.
    pub async fn publish(&self, identity: ToolIdentity, info: VersionInfo) {
        insert_version(&mut *self.tools.write().await, identity, info);
    }

    /// Removes a tool and all its versions.
    pub async fn withdraw(&self, identity: &ToolIdentity) -> bool {
        self.tools.write().await.remove(identity).is_some()
    }

    /// Returns every tool identity in the catalog.
    pub async fn identities(&self) -> Vec<ToolIdentity> {
        self.tools.read().await.keys().cloned().collect()
    }
}

fn insert_version(
    tools: &mut BTreeMap<ToolIdentity, Vec<VersionInfo>>,
    identity: ToolIdentity,
    info: VersionInfo,
) {
    let versions = tools.entry(identity).or_default();
    versions.retain(|v| compare_versions(&v.version, &info.version) != Ordering::Equal);
    versions.push(info);
    versions.sort_by(|a, b| compare_versions(&a.version, &b.version));
}

#[async_trait]
impl CatalogClient for StaticCatalog {
    async fn get_tool_version(
        &self,
        identity: &ToolIdentity,
        version: Option<&str>,
    ) -> Result<ResolvedTool, PackageError> {
        let tools = self.tools.read().await;
        let versions = tools
            .get(identity)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| PackageError::ToolNotFound {
                identity: identity.clone(),
            })?;

        let latest = versions
            .iter()
            .max_by(|a, b| Version::parse(&a.version).cmp(&Version::parse(&b.version)))
            .ok_or_else(|| PackageError::ToolNotFound {
                identity: identity.clone(),
            })?;

        let selected = match version {
            None => latest,
            Some(requested) => versions
                .iter()
                .find(|v| compare_versions(&v.version, requested) == Ordering::Equal)
                .ok_or_else(|| PackageError::VersionNotFound {
                    identity: identity.clone(),
                    version: requested.to_string(),
                    available: versions
                        .iter()
                        .map(|v| v.version.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                })?,
        };

        Ok(ResolvedTool {
            identity: identity.clone(),
            version: selected.clone(),
            latest_version: latest.version.clone(),
        })
    }

    async fn registry_origin(&self) -> Result<String, PackageError> {
        Ok(self.origin.clone())
    }
}
