//! Update orchestrator.
//!
//! Compares ledger records with the catalog's latest versions and drives
//! updates through the [`Installer`], so updates get the same backup and
//! rollback guarantees as installs.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::PackageError;
use super::installer::Installer;
use super::types::{BatchReport, InstallReport, OutdatedEntry, ToolIdentity, ToolSpec};
use super::version::Version;

/// Finds and applies updates for installed tools.
pub struct Updater {
    installer: Arc<Installer>,
}

impl Updater {
    pub fn new(installer: Arc<Installer>) -> Self {
        Self { installer }
    }

    pub fn installer(&self) -> &Arc<Installer> {
        &self.installer
    }

    /// Returns every installed tool whose version is older than the catalog's
    /// latest.
    ///
    /// Tools the catalog no longer knows are skipped; other catalog errors
    /// are returned.
    pub async fn check_outdated(&self) -> Result<Vec<OutdatedEntry>, PackageError> {
        let records = self.installer.ledger().list().await?;
        let mut outdated = Vec::new();

        for (identity, record) in records {
            let latest = match self.latest_version(&identity).await? {
                Some(latest) => latest,
                None => continue,
            };

            if Version::parse(&record.version).is_older_than(&Version::parse(&latest)) {
                debug!(tool = %identity, "{} -> {} available", record.version, latest);
                outdated.push(OutdatedEntry {
                    identity,
                    current: record.version,
                    latest,
                });
            }
        }

        info!("{} tool(s) outdated", outdated.len());
        Ok(outdated)
    }

    /// Updates one installed tool to the catalog's latest version.
    ///
    /// A tool that is already current is reported as skipped.
    pub async fn update(
        &self,
        identity: &ToolIdentity,
        cancel: &CancellationToken,
    ) -> Result<InstallReport, PackageError> {
        let record = self.installer.ledger().get(identity).await?;
        let latest = self
            .installer
            .catalog()
            .get_tool_version(identity, None)
            .await?
            .latest_version;

        if !Version::parse(&record.version).is_older_than(&Version::parse(&latest)) {
            info!(tool = %identity, "Already up to date at {}", record.version);
            return Ok(InstallReport {
                identity: identity.clone(),
                old_version: Some(record.version.clone()),
                new_version: record.version,
                skipped: true,
                integrity: None,
            });
        }

        let spec = ToolSpec::new(identity.clone(), Some(latest));
        self.installer.install(&spec, cancel).await
    }

    /// Updates every outdated tool, continuing past individual failures.
    pub async fn update_all(&self, cancel: &CancellationToken) -> Result<BatchReport, PackageError> {
        let outdated = self.check_outdated().await?;
        let mut report = BatchReport::default();

        for entry in outdated {
            match self.update(&entry.identity, cancel).await {
                Ok(result) => report.results.push(result),
                Err(e) => {
                    warn!(tool = %entry.identity, "Update failed: {}", e);
                    report.errors.push((entry.identity.to_string(), e));
                }
            }
        }

        info!(
            "Updated {} tool(s), {} failed",
            report.changed(),
            report.errors.len()
        );
        Ok(report)
    }

    /// Latest catalog version, or None if the tool was withdrawn.
    async fn latest_version(&self, identity: &ToolIdentity) -> Result<Option<String>, PackageError> {
        match self.installer.catalog().get_tool_version(identity, None).await {
            Ok(resolved) => Ok(Some(resolved.latest_version)),
            Err(PackageError::ToolNotFound { .. }) => {
                debug!(tool = %identity, "No longer in catalog, skipping");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
