//! Query backends
//!
//! Both slots expose the same capability set ([`ZoneBackend`]): point check,
//! preload and geocode. Production backends are the closed set in
//! [`Backend`]; the router selects by [`BackendSlot`], never by type.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::ZoneCache;
use crate::error::{ZoneError, ZoneResult};
use crate::spatial::Coordinates;

/// Default remote request timeout
pub const REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Types
// =============================================================================

/// Caller-facing result of a point check
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointCheck {
    /// Whether the point lies in a zone
    pub is_in_zone: bool,
    /// Identifier of the matching zone
    pub zone_id: Option<String>,
    /// Version of the dataset that answered
    pub dataset_version: String,
    /// When that dataset was loaded
    pub dataset_last_updated: DateTime<Utc>,
    /// Number of zones in that dataset
    pub feature_count: usize,
}

/// Logical backend position
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendSlot {
    /// In-process engine
    Primary,
    /// Delegated remote service
    Secondary,
}

impl BackendSlot {
    /// The other slot
    #[must_use]
    pub fn alternate(self) -> Self {
        match self {
            Self::Primary => Self::Secondary,
            Self::Secondary => Self::Primary,
        }
    }
}

impl std::fmt::Display for BackendSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
        }
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Capability set shared by every query backend
#[async_trait]
pub trait ZoneBackend: Send + Sync {
    /// Backend name for logs and metrics
    fn name(&self) -> &str;

    /// Get ready to serve (load data, verify connectivity)
    async fn preload(&self) -> ZoneResult<()>;

    /// Check whether `coords` lies in a zone
    async fn check_point(&self, coords: Coordinates) -> ZoneResult<PointCheck>;

    /// Resolve a free-text address
    async fn geocode(&self, address: &str) -> ZoneResult<Coordinates>;
}

/// Address to coordinate resolution
#[async_trait]
pub trait Geocoder: Send + Sync + std::fmt::Debug {
    /// Resolve `address`
    async fn geocode(&self, address: &str) -> ZoneResult<Coordinates>;
}

// =============================================================================
// Local
// =============================================================================

/// In-process engine backed by the zone cache
#[derive(Clone, Debug)]
pub struct LocalBackend {
    cache: ZoneCache,
    geocoder: Option<Arc<dyn Geocoder>>,
}

impl LocalBackend {
    /// Create a local backend
    #[must_use]
    pub fn new(cache: ZoneCache) -> Self {
        Self {
            cache,
            geocoder: None,
        }
    }

    /// Attach a geocoder
    #[must_use]
    pub fn with_geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    /// The underlying cache
    #[must_use]
    pub fn cache(&self) -> &ZoneCache {
        &self.cache
    }
}

#[async_trait]
impl ZoneBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn preload(&self) -> ZoneResult<()> {
        let metadata = self.cache.initialize().await?;
        tracing::info!(
            features = metadata.feature_count,
            version = %metadata.version,
            "Local backend ready"
        );
        Ok(())
    }

    async fn check_point(&self, coords: Coordinates) -> ZoneResult<PointCheck> {
        let hit = self.cache.query(coords).await?;
        Ok(PointCheck {
            is_in_zone: hit.zone.in_zone,
            zone_id: hit.zone.zone_id,
            dataset_version: hit.metadata.version,
            dataset_last_updated: hit.metadata.loaded_at,
            feature_count: hit.metadata.feature_count,
        })
    }

    async fn geocode(&self, address: &str) -> ZoneResult<Coordinates> {
        match &self.geocoder {
            Some(geocoder) => geocoder.geocode(address).await,
            None => Err(ZoneError::Configuration(
                "no geocoder configured for the local backend".to_string(),
            )),
        }
    }
}

// =============================================================================
// Remote
// =============================================================================

#[derive(Serialize)]
struct CheckPointRequest {
    lat: f64,
    lon: f64,
}

#[derive(Serialize)]
struct GeocodeRequest<'a> {
    address: &'a str,
}

#[derive(Deserialize)]
struct GeocodeResponse {
    lat: f64,
    lon: f64,
    #[serde(default)]
    display_name: Option<String>,
}

/// Delegated query service reached over HTTP
#[derive(Clone, Debug)]
pub struct RemoteBackend {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl RemoteBackend {
    /// Create a remote backend
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the URL is empty or the client cannot be
    /// built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> ZoneResult<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ZoneError::Configuration(
                "remote service URL is empty".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ZoneError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url,
            api_key: api_key.filter(|k| !k.is_empty()),
            client,
        })
    }

    /// Base URL without a trailing slash
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> ZoneResult<reqwest::Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| ZoneError::backend(self.name(), e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ZoneError::backend(self.name(), format!("HTTP status {status}")));
        }
        Ok(response)
    }
}

#[async_trait]
impl ZoneBackend for RemoteBackend {
    fn name(&self) -> &str {
        "remote"
    }

    async fn preload(&self) -> ZoneResult<()> {
        let url = format!("{}/health", self.base_url);
        self.send(self.client.get(&url)).await?;
        tracing::info!(url = %self.base_url, "Remote backend reachable");
        Ok(())
    }

    async fn check_point(&self, coords: Coordinates) -> ZoneResult<PointCheck> {
        let url = format!("{}/api/check-point", self.base_url);
        let body = CheckPointRequest {
            lat: coords.latitude,
            lon: coords.longitude,
        };
        let response = self.send(self.client.post(&url).json(&body)).await?;
        response
            .json::<PointCheck>()
            .await
            .map_err(|e| ZoneError::backend(self.name(), format!("invalid response: {e}")))
    }

    async fn geocode(&self, address: &str) -> ZoneResult<Coordinates> {
        let url = format!("{}/api/geocode", self.base_url);
        let response = self
            .send(self.client.post(&url).json(&GeocodeRequest { address }))
            .await?;
        let located: GeocodeResponse = response
            .json()
            .await
            .map_err(|e| ZoneError::backend(self.name(), format!("invalid response: {e}")))?;
        tracing::debug!(
            address,
            display_name = located.display_name.as_deref().unwrap_or("-"),
            "Address geocoded remotely"
        );
        Coordinates::new(located.lat, located.lon).map_err(|e| {
            ZoneError::backend(self.name(), format!("invalid coordinates in response: {e}"))
        })
    }
}

// =============================================================================
// Closed Set
// =============================================================================

/// Production backends
#[derive(Clone, Debug)]
pub enum Backend {
    /// In-process engine
    Local(LocalBackend),
    /// Remote service
    Remote(RemoteBackend),
}

impl Backend {
    /// The zone cache, for the local engine
    #[must_use]
    pub fn cache(&self) -> Option<&ZoneCache> {
        match self {
            Self::Local(local) => Some(local.cache()),
            Self::Remote(_) => None,
        }
    }
}

#[async_trait]
impl ZoneBackend for Backend {
    fn name(&self) -> &str {
        match self {
            Self::Local(b) => b.name(),
            Self::Remote(b) => b.name(),
        }
    }

    async fn preload(&self) -> ZoneResult<()> {
        match self {
            Self::Local(b) => b.preload().await,
            Self::Remote(b) => b.preload().await,
        }
    }

    async fn check_point(&self, coords: Coordinates) -> ZoneResult<PointCheck> {
        match self {
            Self::Local(b) => b.check_point(coords).await,
            Self::Remote(b) => b.check_point(coords).await,
        }
    }

    async fn geocode(&self, address: &str) -> ZoneResult<Coordinates> {
        match self {
            Self::Local(b) => b.geocode(address).await,
            Self::Remote(b) => b.geocode(address).await,
        }
    }
}
