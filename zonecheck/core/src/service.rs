//! Zone service: the composition root
//!
//! Wires the dataset source, shared store, zone cache, rate limiter, flags
//! and backend router from one [`ZoneCheckConfigFile`]. Each instance owns
//! its own state; nothing here is global.
//!
//! ```text
//! check_point(identity, lat, lon)
//!     │
//!     ├─> RateLimiter::check        (RateLimitExceeded)
//!     ├─> Coordinates::new          (Validation)
//!     └─> ResilientQueryService     (BackendUnavailable)
//!             ├─ Local  -> ZoneCache -> SpatialIndex
//!             └─ Remote -> HTTP
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheMetrics, DatasetSource, FileSource, HttpSource, UnconfiguredSource, ZoneCache};
use crate::clock::{SharedClock, SystemClock};
use crate::config::{DatasetLocation, ZoneCheckConfigFile};
use crate::dataset::DatasetMetadata;
use crate::error::{ZoneError, ZoneResult};
use crate::rate_limit::{RateLimiter, RateLimiterStats};
use crate::routing::{
    Backend, BackendSlot, FeatureFlags, Geocoder, LocalBackend, PointCheck, RemoteBackend,
    ResilientQueryService, ServiceMetrics,
};
use crate::spatial::Coordinates;
use crate::store::{DistributedCacheStore, SharedStore};
use crate::task::PeriodicTask;

// =============================================================================
// Background Tasks
// =============================================================================

/// Handles to the service's periodic tasks
pub struct BackgroundTasks {
    tasks: Vec<PeriodicTask>,
}

impl BackgroundTasks {
    /// Names of the running tasks
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(PeriodicTask::name).collect()
    }

    /// Number of tasks
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no tasks were started
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Stop every task and wait for them to exit
    pub async fn stop(self) {
        for task in self.tasks {
            task.stop().await;
        }
        tracing::info!("Background tasks stopped");
    }
}

impl std::fmt::Debug for BackgroundTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTasks")
            .field("tasks", &self.names())
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builds a [`ZoneService`] from configuration, with optional overrides for
/// the pieces tests and embedders usually replace
#[derive(Debug)]
pub struct ZoneServiceBuilder {
    config: ZoneCheckConfigFile,
    clock: Option<SharedClock>,
    source: Option<Arc<dyn DatasetSource>>,
    store: Option<SharedStore>,
    geocoder: Option<Arc<dyn Geocoder>>,
}

impl ZoneServiceBuilder {
    /// Start from `config`
    #[must_use]
    pub fn new(config: ZoneCheckConfigFile) -> Self {
        Self {
            config,
            clock: None,
            source: None,
            store: None,
            geocoder: None,
        }
    }

    /// Use `clock` instead of the system clock
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use `source` instead of the configured dataset location
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn DatasetSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Use `store` instead of the configured store URL
    #[must_use]
    pub fn with_store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Give the local engine a geocoder
    #[must_use]
    pub fn with_geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    /// Validate the configuration and wire the service
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for invalid settings, an unusable store URL or
    /// an unusable remote service URL. A missing dataset location is not an
    /// error here; the local engine reports it when used.
    pub fn build(self) -> ZoneResult<ZoneService> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| ZoneError::Configuration(e.to_string()))?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let source = match self.source {
            Some(source) => source,
            None => source_for(&config)?,
        };

        let store = match self.store {
            Some(store) => store,
            None => SharedStore::from_url(config.store_url.as_deref(), config.store_command_timeout)?,
        };

        let snapshots = DistributedCacheStore::new(
            store.clone(),
            &config.cache.store_prefix,
            config.cache.ttl,
            Arc::clone(&clock),
        );
        let cache = ZoneCache::new(config.cache.clone(), Arc::clone(&source), snapshots, Arc::clone(&clock));

        let mut local = LocalBackend::new(cache);
        if let Some(geocoder) = self.geocoder {
            local = local.with_geocoder(geocoder);
        }

        let remote = config
            .remote
            .as_ref()
            .map(|r| RemoteBackend::new(r.url.clone(), r.api_key.clone(), r.timeout))
            .transpose()?;
        let remote_url = remote.as_ref().map(|r| r.base_url().to_string());

        let flags = FeatureFlags::new(config.use_remote_service, Arc::clone(&clock));
        let router = ResilientQueryService::new(
            Backend::Local(local),
            remote.map(Backend::Remote),
            flags,
            config.resilience.clone(),
            Arc::clone(&clock),
        );

        let limiter = RateLimiter::new(config.rate_limit.clone(), store.clone(), Arc::clone(&clock));

        tracing::info!(
            source = %source.describe(),
            store = store.kind(),
            remote = remote_url.as_deref().unwrap_or("-"),
            prefer_remote = config.use_remote_service,
            rate_limit = config.rate_limit.enabled,
            "Zone service configured"
        );

        Ok(ZoneService {
            router,
            limiter,
            store,
            store_probe_interval: config.store_probe_interval,
        })
    }
}

fn source_for(config: &ZoneCheckConfigFile) -> ZoneResult<Arc<dyn DatasetSource>> {
    Ok(match &config.dataset {
        DatasetLocation::Url(url) => Arc::new(HttpSource::new(url.clone(), config.cache.fetch_timeout)?),
        DatasetLocation::File(path) => Arc::new(FileSource::new(path.clone())),
        DatasetLocation::Unconfigured => {
            tracing::warn!("No zone dataset source configured; local lookups will fail");
            Arc::new(UnconfiguredSource)
        }
    })
}

// =============================================================================
// Service
// =============================================================================

/// Point-in-zone service
#[derive(Debug)]
pub struct ZoneService {
    router: ResilientQueryService,
    limiter: RateLimiter,
    store: SharedStore,
    store_probe_interval: Duration,
}

impl ZoneService {
    /// Wire a service from configuration with the system clock
    ///
    /// # Errors
    ///
    /// See [`ZoneServiceBuilder::build`].
    pub fn from_config(config: ZoneCheckConfigFile) -> ZoneResult<Self> {
        ZoneServiceBuilder::new(config).build()
    }

    /// Start a builder
    #[must_use]
    pub fn builder(config: ZoneCheckConfigFile) -> ZoneServiceBuilder {
        ZoneServiceBuilder::new(config)
    }

    /// Check whether (`lat`, `lon`) lies in a zone on behalf of `identity`
    ///
    /// The rate limit is counted before the coordinates are validated, so
    /// malformed requests still consume quota.
    ///
    /// # Errors
    ///
    /// `RateLimitExceeded`, `Validation` for out-of-range coordinates, or
    /// `BackendUnavailable` when no backend could answer.
    pub async fn check_point(&self, identity: &str, lat: f64, lon: f64) -> ZoneResult<PointCheck> {
        self.limiter.check(identity).await?;
        let coords = Coordinates::new(lat, lon)?;
        self.router.check_point(coords).await
    }

    /// [`ZoneService::check_point`] bounded by `deadline`
    ///
    /// A refresh started by this call keeps running after the deadline.
    ///
    /// # Errors
    ///
    /// `Timeout` when the deadline passes, otherwise as `check_point`.
    pub async fn check_point_with_timeout(
        &self,
        identity: &str,
        lat: f64,
        lon: f64,
        deadline: Duration,
    ) -> ZoneResult<PointCheck> {
        tokio::time::timeout(deadline, self.check_point(identity, lat, lon))
            .await
            .map_err(|_| {
                ZoneError::Timeout(format!(
                    "point check exceeded {}ms",
                    deadline.as_millis()
                ))
            })?
    }

    /// Resolve `address` through the healthiest backend
    ///
    /// # Errors
    ///
    /// `Validation` for a blank address, otherwise `BackendUnavailable`.
    pub async fn geocode(&self, address: &str) -> ZoneResult<Coordinates> {
        let address = address.trim();
        if address.is_empty() {
            return Err(ZoneError::Validation("address must not be empty".to_string()));
        }
        self.router.geocode(address).await
    }

    /// Preload every backend; returns the slots that are ready
    pub async fn warm(&self) -> Vec<BackendSlot> {
        let ready = self.router.initialize().await;
        tracing::info!(ready = ?ready, "Zone service warmed");
        ready
    }

    /// Refresh the local dataset from its source now
    ///
    /// # Errors
    ///
    /// The refresh error, or `Configuration` without a local engine.
    pub async fn force_refresh(&self) -> ZoneResult<DatasetMetadata> {
        self.local_cache()?.force_refresh().await
    }

    /// Drop the local snapshot and its shared copy
    ///
    /// # Errors
    ///
    /// `Configuration` without a local engine.
    pub async fn invalidate(&self) -> ZoneResult<bool> {
        Ok(self.local_cache()?.invalidate().await)
    }

    /// Local cache metrics, `None` without a local engine
    #[must_use]
    pub fn cache_metrics(&self) -> Option<CacheMetrics> {
        self.cache().map(ZoneCache::metrics)
    }

    /// Backend health
    #[must_use]
    pub fn health_metrics(&self) -> ServiceMetrics {
        self.router.metrics()
    }

    /// Rate limiter counters
    #[must_use]
    pub fn rate_limit_stats(&self) -> RateLimiterStats {
        self.limiter.stats()
    }

    /// Runtime feature flags
    #[must_use]
    pub fn flags(&self) -> &Arc<FeatureFlags> {
        self.router.flags()
    }

    /// The rate limiter
    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// The backend router
    #[must_use]
    pub fn router(&self) -> &ResilientQueryService {
        &self.router
    }

    /// Start the refresh ticker, the rate window sweeper and, with a shared
    /// store, the connection probe
    #[must_use]
    pub fn start_background_tasks(&self) -> BackgroundTasks {
        let mut tasks = Vec::with_capacity(3);
        if let Some(cache) = self.cache() {
            tasks.push(cache.start_refresh_ticker());
        }
        tasks.push(self.limiter.start_sweeper());
        if let Some(probe) = self.store.start_probe(self.store_probe_interval) {
            tasks.push(probe);
        }
        let background = BackgroundTasks { tasks };
        tracing::info!(tasks = ?background.names(), "Background tasks started");
        background
    }

    fn cache(&self) -> Option<&ZoneCache> {
        self.router.backend(BackendSlot::Primary).and_then(Backend::cache)
    }

    fn local_cache(&self) -> ZoneResult<&ZoneCache> {
        self.cache()
            .ok_or_else(|| ZoneError::Configuration("no local zone engine configured".to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::RateLimitPolicy;
    use crate::routing::ZoneBackend;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    const SQUARE: &str = r#"{
        "type": "FeatureCollection",
        "features": [{
            "type": "Feature",
            "properties": {"GEOID": "Z-1", "NAME": "Square"},
            "geometry": {
                "type": "Polygon",
                "coordinates": [[[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0], [0.0, 0.0]]]
            }
        }]
    }"#;

    #[derive(Debug)]
    struct StaticSource(&'static str);

    #[async_trait]
    impl DatasetSource for StaticSource {
        async fn fetch(&self) -> ZoneResult<Vec<u8>> {
            Ok(self.0.as_bytes().to_vec())
        }

        fn describe(&self) -> String {
            "static".to_string()
        }
    }

    #[derive(Debug)]
    struct FixedGeocoder;

    #[async_trait]
    impl Geocoder for FixedGeocoder {
        async fn geocode(&self, _address: &str) -> ZoneResult<Coordinates> {
            Coordinates::new(5.0, 5.0)
        }
    }

    fn service_with(config: ZoneCheckConfigFile) -> ZoneService {
        let clock: SharedClock = Arc::new(ManualClock::at_unix(1_700_000_000));
        ZoneService::builder(config)
            .with_clock(Arc::clone(&clock))
            .with_source(Arc::new(StaticSource(SQUARE)))
            .with_store(SharedStore::Memory(MemoryStore::new(clock)))
            .with_geocoder(Arc::new(FixedGeocoder))
            .build()
            .unwrap()
    }

    // =========================================================================
    // Wiring Tests
    // =========================================================================

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = ZoneCheckConfigFile::default();
        config.cache.ttl = Duration::ZERO;
        let err = ZoneService::from_config(config).unwrap_err();
        assert!(matches!(err, ZoneError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_unconfigured_source_fails_on_use() {
        let service = ZoneService::from_config(ZoneCheckConfigFile::default()).unwrap();

        assert!(service.cache_metrics().is_some());
        let err = service.force_refresh().await.unwrap_err();
        assert!(matches!(err, ZoneError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_remote_configured_as_secondary() {
        let mut config = ZoneCheckConfigFile::default();
        config.remote = Some(crate::config::RemoteConfig {
            url: "http://127.0.0.1:9/".to_string(),
            api_key: None,
            timeout: Duration::from_secs(1),
        });
        config.use_remote_service = true;
        let service = service_with(config);

        let remote = service.router().backend(BackendSlot::Secondary).unwrap();
        assert_eq!(remote.name(), "remote");
        assert_eq!(service.router().preferred_slot(), BackendSlot::Secondary);
    }

    // =========================================================================
    // Query Tests
    // =========================================================================

    #[tokio::test]
    async fn test_check_point_inside_and_outside() {
        let service = service_with(ZoneCheckConfigFile::default());

        let inside = service.check_point("web-app", 5.0, 5.0).await.unwrap();
        assert!(inside.is_in_zone);
        assert_eq!(inside.zone_id.as_deref(), Some("Z-1"));
        assert_eq!(inside.feature_count, 1);

        let outside = service.check_point("web-app", 20.0, 20.0).await.unwrap();
        assert!(!outside.is_in_zone);
        assert!(outside.zone_id.is_none());
        assert_eq!(outside.dataset_version, inside.dataset_version);
    }

    #[tokio::test]
    async fn test_invalid_coordinates_still_count() {
        let mut config = ZoneCheckConfigFile::default();
        config.rate_limit = config
            .rate_limit
            .with_policy("web-app", RateLimitPolicy::new(60, 1, "ratelimit:webapp"));
        let service = service_with(config);

        let err = service.check_point("web-app", 91.0, 0.0).await.unwrap_err();
        assert!(matches!(err, ZoneError::Validation(_)));

        let err = service.check_point("web-app", 5.0, 5.0).await.unwrap_err();
        assert!(matches!(err, ZoneError::RateLimitExceeded { limit: 1, .. }));
        assert_eq!(service.rate_limit_stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_geocode_uses_local_geocoder() {
        let service = service_with(ZoneCheckConfigFile::default());
        let coords = service.geocode(" 1 Main St ").await.unwrap();
        assert_eq!(coords, Coordinates::new(5.0, 5.0).unwrap());

        let err = service.geocode("   ").await.unwrap_err();
        assert!(matches!(err, ZoneError::Validation(_)));
    }

    // =========================================================================
    // Operations Tests
    // =========================================================================

    #[tokio::test]
    async fn test_warm_refresh_invalidate() {
        let service = service_with(ZoneCheckConfigFile::default());

        assert_eq!(service.warm().await, vec![BackendSlot::Primary]);
        let metrics = service.cache_metrics().unwrap();
        assert!(metrics.is_initialized);
        assert_eq!(metrics.feature_count, 1);

        let meta = service.force_refresh().await.unwrap();
        assert_eq!(Some(meta.version), service.cache_metrics().unwrap().version);

        assert!(service.invalidate().await.unwrap());
        assert!(!service.cache_metrics().unwrap().is_initialized);
    }

    #[tokio::test]
    async fn test_check_point_with_timeout_passes_through() {
        let service = service_with(ZoneCheckConfigFile::default());
        let check = service
            .check_point_with_timeout("web-app", 1.0, 1.0, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(check.is_in_zone);
    }

    #[tokio::test]
    async fn test_background_tasks_start_and_stop() {
        let service = service_with(ZoneCheckConfigFile::default());
        let tasks = service.start_background_tasks();
        assert_eq!(tasks.names(), vec!["zone-refresh", "rate-limit-sweep", "store-probe"]);
        tasks.stop().await;

        let service = ZoneService::from_config(ZoneCheckConfigFile::default()).unwrap();
        let tasks = service.start_background_tasks();
        assert_eq!(tasks.len(), 2);
        tasks.stop().await;
    }
}
