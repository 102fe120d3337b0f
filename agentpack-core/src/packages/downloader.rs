//! Archive fetching with retry, timeout and rate-limit handling.
//!
//! [`ArchiveFetcher`] is the capability the installer consumes. [`HttpFetcher`]
//! implements it over reqwest with streaming downloads, progress reporting,
//! URL validation and a bounded [`RetryPolicy`]. Callers see either the bytes
//! or a single error: exhausted retries surface as `PackageError::Transient`,
//! definitive HTTP failures (not found, auth) as `PackageError::FetchRejected`.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

#[cfg(test)]
use mockall::automock;

use super::error::PackageError;

// ============================================================================
// URL Security Validation
// ============================================================================

/// Which download URLs are acceptable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlPolicy {
    /// Allowed hosts; subdomains of an entry are allowed too.
    pub allowed_hosts: Vec<String>,
    /// Reject anything but `https`.
    pub require_https: bool,
}

impl Default for UrlPolicy {
    fn default() -> Self {
        Self {
            allowed_hosts: vec![
                "github.com".to_string(),
                "githubusercontent.com".to_string(),
            ],
            require_https: true,
        }
    }
}

impl UrlPolicy {
    /// Validates that a URL is safe for downloading.
    ///
    /// Checks:
    /// - URL scheme must be HTTPS (unless disabled)
    /// - Host must be in the allowed host list
    pub fn validate(&self, url_str: &str) -> Result<Url, PackageError> {
        let reject = |reason: String| PackageError::UrlNotAllowed {
            url: url_str.to_string(),
            reason,
        };

        let url = Url::parse(url_str).map_err(|e| reject(e.to_string()))?;

        let scheme_ok = match url.scheme() {
            "https" => true,
            "http" => !self.require_https,
            _ => false,
        };
        if !scheme_ok {
            return Err(reject(format!("scheme '{}' is not allowed", url.scheme())));
        }

        let host = url
            .host_str()
            .ok_or_else(|| reject("URL has no host".to_string()))?;

        let is_allowed = self
            .allowed_hosts
            .iter()
            .any(|domain| host == domain || host.ends_with(&format!(".{}", domain)));
        if !is_allowed {
            return Err(reject(format!(
                "host {} is not in {:?}",
                host, self.allowed_hosts
            )));
        }

        Ok(url)
    }
}

// ============================================================================
// Retry Policy
// ============================================================================

/// Why a single request attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    Timeout,
    Connect,
    /// Response body broke off mid-stream.
    Body,
    /// Non-success HTTP status.
    Status(u16),
}

/// Default retry predicate: network trouble and server errors are transient,
/// other statuses are definitive.
pub fn default_retry_predicate(failure: &FetchFailure) -> bool {
    match failure {
        FetchFailure::Timeout | FetchFailure::Connect | FetchFailure::Body => true,
        FetchFailure::Status(status) => *status == 408 || *status >= 500,
    }
}

/// Bounded retry with exponential backoff.
#[derive(Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts for transient failures, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per attempt.
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff delay.
    pub max_delay_ms: u64,
    /// Timeout for one whole request including the body.
    pub timeout_secs: u64,
    /// Longest rate-limit reset window honoured before giving up.
    pub max_rate_limit_wait_secs: u64,
    /// Decides whether a failure is worth another attempt.
    #[serde(skip)]
    pub retry_if: fn(&FetchFailure) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            timeout_secs: 600,
            max_rate_limit_wait_secs: 3_600,
            retry_if: default_retry_predicate,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay_ms", &self.base_delay_ms)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_rate_limit_wait_secs", &self.max_rate_limit_wait_secs)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Backoff before attempt `failed_attempts + 1`.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(20);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Per-request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Returns true if `failure` should be retried.
    pub fn should_retry(&self, failure: &FetchFailure) -> bool {
        (self.retry_if)(failure)
    }
}

// ============================================================================
// Download Progress
// ============================================================================

/// Progress information during a download.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    /// Bytes downloaded so far.
    pub bytes_downloaded: u64,
    /// Total bytes expected (from Content-Length or the catalog).
    pub total_bytes: Option<u64>,
    /// Progress percentage (0.0 to 100.0), or None if total is unknown.
    pub percent: Option<f32>,
}

impl DownloadProgress {
    fn new(bytes_downloaded: u64, total_bytes: Option<u64>) -> Self {
        let percent = total_bytes.map(|total| {
            if total > 0 {
                (bytes_downloaded as f32 / total as f32) * 100.0
            } else {
                0.0
            }
        });

        Self {
            bytes_downloaded,
            total_bytes,
            percent,
        }
    }
}

type ProgressCallback = Box<dyn Fn(DownloadProgress) + Send + Sync>;

// ============================================================================
// Fetcher Capability
// ============================================================================

/// Archive byte acquisition as consumed by the installer.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ArchiveFetcher: Send + Sync {
    /// Fetches the archive at `url`.
    ///
    /// `expected_size` is the catalog's published size (0 if unknown).
    async fn fetch(
        &self,
        url: &str,
        expected_size: u64,
        show_progress: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, PackageError>;
}

// ============================================================================
// HTTP Fetcher
// ============================================================================

/// Default cap on a downloaded archive, matching the default extraction limit.
pub const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 1024 * 1024 * 1024;

enum AttemptError {
    Failed(FetchFailure, String),
    RateLimited(Duration),
    TooLarge(u64),
}

/// Streaming HTTP fetcher with retries.
pub struct HttpFetcher {
    client: reqwest::Client,
    policy: RetryPolicy,
    url_policy: UrlPolicy,
    max_bytes: u64,
    progress_cb: Option<ProgressCallback>,
}

impl HttpFetcher {
    /// Creates a fetcher with the given retry and URL policies.
    pub fn new(policy: RetryPolicy, url_policy: UrlPolicy) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("agentpack/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            policy,
            url_policy,
            max_bytes: DEFAULT_MAX_DOWNLOAD_BYTES,
            progress_cb: None,
        }
    }

    /// Sets the largest body accepted when the catalog declares no larger size.
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Installs a callback receiving progress updates when progress is requested.
    pub fn with_progress<F>(mut self, progress_cb: F) -> Self
    where
        F: Fn(DownloadProgress) + Send + Sync + 'static,
    {
        self.progress_cb = Some(Box::new(progress_cb));
        self
    }

    fn report(&self, show_progress: bool, progress: DownloadProgress) {
        if !show_progress {
            return;
        }
        match &self.progress_cb {
            Some(cb) => cb(progress),
            None => {
                if let Some(percent) = progress.percent {
                    debug!("Download progress: {:.1}%", percent);
                }
            }
        }
    }

    async fn attempt(
        &self,
        url: &str,
        expected_size: u64,
        show_progress: bool,
    ) -> Result<Vec<u8>, AttemptError> {
        let response = self
            .client
            .get(url)
            .timeout(self.policy.timeout())
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            if let Some(wait) = rate_limit_wait(&response) {
                return Err(AttemptError::RateLimited(wait));
            }
            return Err(AttemptError::Failed(
                FetchFailure::Status(status.as_u16()),
                format!(
                    "HTTP {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown error")
                ),
            ));
        }

        let total_bytes = response
            .content_length()
            .or((expected_size > 0).then_some(expected_size));
        debug!("Content-Length: {:?}", total_bytes);

        let limit = self.max_bytes.max(expected_size);
        if response.content_length().is_some_and(|len| len > limit) {
            return Err(AttemptError::TooLarge(limit));
        }

        let mut bytes = Vec::with_capacity(total_bytes.unwrap_or(0).min(64 * 1024 * 1024) as usize);
        let mut stream = response.bytes_stream();

        self.report(show_progress, DownloadProgress::new(0, total_bytes));

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(classify_request_error)?;
            if (bytes.len() + chunk.len()) as u64 > limit {
                return Err(AttemptError::TooLarge(limit));
            }
            bytes.extend_from_slice(&chunk);
            self.report(
                show_progress,
                DownloadProgress::new(bytes.len() as u64, total_bytes),
            );
        }

        Ok(bytes)
    }
}

fn classify_request_error(e: reqwest::Error) -> AttemptError {
    let failure = if e.is_timeout() {
        FetchFailure::Timeout
    } else if e.is_connect() || e.is_request() {
        FetchFailure::Connect
    } else {
        FetchFailure::Body
    };
    AttemptError::Failed(failure, e.to_string())
}

/// Returns the reported reset window if the response is a rate-limit response.
fn rate_limit_wait(response: &reqwest::Response) -> Option<Duration> {
    let status = response.status().as_u16();
    let headers = response.headers();
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
    };

    let exhausted = header("x-ratelimit-remaining").as_deref() == Some("0");
    if status != 429 && !(status == 403 && exhausted) {
        return None;
    }

    if let Some(secs) = header("retry-after").and_then(|v| v.parse::<u64>().ok()) {
        return Some(Duration::from_secs(secs));
    }
    if let Some(reset) = header("x-ratelimit-reset").and_then(|v| v.parse::<i64>().ok()) {
        let secs = (reset - Utc::now().timestamp()).max(0) as u64;
        return Some(Duration::from_secs(secs));
    }
    Some(Duration::from_secs(60))
}

/// Sleeps unless cancelled first.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<(), PackageError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PackageError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[async_trait]
impl ArchiveFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        expected_size: u64,
        show_progress: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, PackageError> {
        info!("Downloading {}", url);

        // Security: Validate URL before downloading
        self.url_policy.validate(url)?;

        let mut failed_attempts = 0u32;
        let mut rate_limit_retry_used = false;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PackageError::Cancelled),
                outcome = self.attempt(url, expected_size, show_progress) => outcome,
            };

            match outcome {
                Ok(bytes) => {
                    if expected_size > 0 && bytes.len() as u64 != expected_size {
                        warn!(
                            "Downloaded {} bytes from {}, catalog declared {}",
                            bytes.len(),
                            url,
                            expected_size
                        );
                    }
                    info!("Download complete: {} bytes from {}", bytes.len(), url);
                    return Ok(bytes);
                }
                Err(AttemptError::TooLarge(limit)) => {
                    return Err(PackageError::DownloadTooLarge {
                        url: url.to_string(),
                        limit,
                    });
                }
                Err(AttemptError::RateLimited(wait)) => {
                    let too_long = wait.as_secs() > self.policy.max_rate_limit_wait_secs;
                    if rate_limit_retry_used || too_long {
                        return Err(PackageError::Transient {
                            url: url.to_string(),
                            attempts: failed_attempts + 1,
                            message: format!("rate limited (reset in {}s)", wait.as_secs()),
                        });
                    }
                    rate_limit_retry_used = true;
                    warn!(
                        "Rate limited fetching {}, waiting {}s before retrying",
                        url,
                        wait.as_secs()
                    );
                    sleep_or_cancel(wait, cancel).await?;
                }
                Err(AttemptError::Failed(failure, message)) => {
                    failed_attempts += 1;

                    if !self.policy.should_retry(&failure) {
                        return Err(match failure {
                            FetchFailure::Status(status) => PackageError::FetchRejected {
                                url: url.to_string(),
                                status,
                            },
                            _ => PackageError::Transient {
                                url: url.to_string(),
                                attempts: failed_attempts,
                                message,
                            },
                        });
                    }

                    if failed_attempts >= self.policy.max_attempts {
                        return Err(PackageError::Transient {
                            url: url.to_string(),
                            attempts: failed_attempts,
                            message,
                        });
                    }

                    let delay = self.policy.delay_for(failed_attempts);
                    warn!(
                        "Attempt {}/{} for {} failed ({}), retrying in {:?}",
                        failed_attempts, self.policy.max_attempts, url, message, delay
                    );
                    sleep_or_cancel(delay, cancel).await?;
                }
            }
        }
    }
}
