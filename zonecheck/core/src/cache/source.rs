//! Dataset sources
//!
//! A source hands back the raw bytes of a GeoJSON document. Parsing,
//! validation and hashing happen in the cache so every source gets the same
//! treatment.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ZoneError, ZoneResult};

/// Where zone documents come from
#[async_trait]
pub trait DatasetSource: Send + Sync + std::fmt::Debug {
    /// Fetch the raw document
    async fn fetch(&self) -> ZoneResult<Vec<u8>>;

    /// Human-readable location for logs
    fn describe(&self) -> String;
}

// =============================================================================
// HTTP
// =============================================================================

/// Fetch over HTTP(S)
#[derive(Clone, Debug)]
pub struct HttpSource {
    url: String,
    client: reqwest::Client,
}

impl HttpSource {
    /// Create a source for `url`
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the URL is empty or the HTTP client cannot
    /// be built.
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> ZoneResult<Self> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(ZoneError::Configuration(
                "dataset source URL is empty".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ZoneError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl DatasetSource for HttpSource {
    async fn fetch(&self) -> ZoneResult<Vec<u8>> {
        tracing::info!(url = %self.url, "Fetching zone dataset");

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| ZoneError::SourceUnavailable(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ZoneError::SourceUnavailable(format!("HTTP status {status}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ZoneError::SourceUnavailable(format!("failed to read body: {e}")))?;
        Ok(body.to_vec())
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

// =============================================================================
// File
// =============================================================================

/// Read from the local filesystem
#[derive(Clone, Debug)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    /// Create a source for `path`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DatasetSource for FileSource {
    async fn fetch(&self) -> ZoneResult<Vec<u8>> {
        tracing::info!(path = %self.path.display(), "Reading zone dataset");
        tokio::fs::read(&self.path).await.map_err(|e| {
            ZoneError::SourceUnavailable(format!("failed to read {}: {e}", self.path.display()))
        })
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

// =============================================================================
// Unconfigured
// =============================================================================

/// Placeholder used when no source location is configured
///
/// Keeps the rest of the service running; only operations that need the
/// dataset fail, with a `Configuration` error.
#[derive(Clone, Debug, Default)]
pub struct UnconfiguredSource;

#[async_trait]
impl DatasetSource for UnconfiguredSource {
    async fn fetch(&self) -> ZoneResult<Vec<u8>> {
        Err(ZoneError::Configuration(
            "zone dataset source not configured (set OPPORTUNITY_ZONES_URL)".to_string(),
        ))
    }

    fn describe(&self) -> String {
        "<unconfigured>".to_string()
    }
}
