//! Zone cache: snapshot lifecycle and refresh orchestration
//!
//! # Refresh Pipeline
//!
//! ```text
//!  fresh? ──yes──> return current
//!    │no
//!    ▼
//!  shared store has unexpired snapshot? ──yes──> validate, adopt, return
//!    │no (or forced)
//!    ▼
//!  fetch (retry + backoff) ─> parse/strip ─> hash
//!    │
//!    ├── hash unchanged ─> renew timestamps, keep index
//!    └── hash changed ───> build index on blocking pool
//!    ▼
//!  atomic swap ─> best-effort save to shared store
//! ```
//!
//! Only one refresh runs at a time ([`SingleFlight`]). Readers clone the
//! current `Arc<ZoneSnapshot>` under a short read lock and never observe a
//! partially built snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::config::CacheConfig;
use super::single_flight::{Joined, SingleFlight};
use super::source::DatasetSource;
use crate::clock::SharedClock;
use crate::dataset::{Dataset, DatasetMetadata, ZoneMatch, ZoneSnapshot};
use crate::error::{ZoneError, ZoneResult};
use crate::spatial::{parse_feature_collection, Coordinates};
use crate::store::DistributedCacheStore;
use crate::task::PeriodicTask;

// =============================================================================
// Metrics
// =============================================================================

/// Operational view of the cache
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetrics {
    /// Whether a snapshot is installed
    pub is_initialized: bool,
    /// When the installed dataset was loaded or last confirmed
    pub last_updated: Option<DateTime<Utc>>,
    /// When the installed dataset becomes stale
    pub next_refresh_due: Option<DateTime<Utc>>,
    /// Features in the installed dataset
    pub feature_count: usize,
    /// Installed dataset version
    pub version: Option<String>,
    /// Installed dataset content hash
    pub content_hash: Option<String>,
    /// Whether the installed dataset is past due
    pub is_stale: bool,
    /// Whether a refresh is running
    pub is_refreshing: bool,
    /// Successful refreshes (source or shared store)
    pub refresh_count: u64,
    /// Spatial index builds
    pub index_builds: u64,
    /// Snapshots adopted from the shared store
    pub snapshot_adoptions: u64,
    /// Refreshes that ended in an error
    pub failed_refreshes: u64,
    /// Refreshes started in the background by stale reads or the ticker
    pub background_refreshes: u64,
    /// Most recent refresh error, cleared on success
    pub last_refresh_error: Option<String>,
    /// Whether a shared store is configured
    pub store_enabled: bool,
    /// Live shared store connection state
    pub store_connected: bool,
}

#[derive(Debug, Default)]
struct CacheCounters {
    refreshes: AtomicU64,
    index_builds: AtomicU64,
    adoptions: AtomicU64,
    failures: AtomicU64,
    background: AtomicU64,
}

/// Result of a cache lookup
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedMatch {
    /// Containment result
    pub zone: ZoneMatch,
    /// Metadata of the dataset that answered
    pub metadata: DatasetMetadata,
}

// =============================================================================
// Zone Cache
// =============================================================================

struct CacheInner {
    config: CacheConfig,
    source: Arc<dyn DatasetSource>,
    store: DistributedCacheStore,
    clock: SharedClock,
    current: RwLock<Option<Arc<ZoneSnapshot>>>,
    flight: SingleFlight<Arc<ZoneSnapshot>>,
    counters: CacheCounters,
    last_error: RwLock<Option<String>>,
}

/// Shared handle to the zone cache (cheap to clone)
#[derive(Clone)]
pub struct ZoneCache {
    inner: Arc<CacheInner>,
}

impl ZoneCache {
    /// Create an empty cache
    pub fn new(
        config: CacheConfig,
        source: Arc<dyn DatasetSource>,
        store: DistributedCacheStore,
        clock: SharedClock,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                source,
                store,
                clock,
                current: RwLock::new(None),
                flight: SingleFlight::new(),
                counters: CacheCounters::default(),
                last_error: RwLock::new(None),
            }),
        }
    }

    /// Cache configuration
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// The installed snapshot, if any
    #[must_use]
    pub fn current(&self) -> Option<Arc<ZoneSnapshot>> {
        self.inner.current.read().clone()
    }

    /// Return a servable snapshot
    ///
    /// With no snapshot installed this waits for the first refresh. A stale
    /// snapshot is returned immediately and a background refresh is started.
    ///
    /// # Errors
    ///
    /// Only when no snapshot exists and the first refresh fails.
    pub async fn ensure_fresh(&self) -> ZoneResult<Arc<ZoneSnapshot>> {
        if let Some(snapshot) = self.current() {
            if snapshot.dataset().is_stale(self.inner.clock.now()) {
                self.spawn_background_refresh();
            }
            return Ok(snapshot);
        }
        self.start_refresh(false).future.await
    }

    /// Look up the zone containing `coords`
    ///
    /// # Errors
    ///
    /// Same as [`ZoneCache::ensure_fresh`].
    pub async fn query(&self, coords: Coordinates) -> ZoneResult<CachedMatch> {
        let snapshot = self.ensure_fresh().await?;
        let zone = snapshot.query(coords);
        tracing::debug!(
            point = %coords,
            in_zone = zone.in_zone,
            zone_id = zone.zone_id.as_deref().unwrap_or("-"),
            "Zone lookup"
        );
        Ok(CachedMatch {
            zone,
            metadata: snapshot.metadata().clone(),
        })
    }

    /// Warm the cache, adopting a shared snapshot when one is available
    ///
    /// # Errors
    ///
    /// When no snapshot exists and the first refresh fails.
    pub async fn initialize(&self) -> ZoneResult<DatasetMetadata> {
        let snapshot = self.ensure_fresh().await?;
        Ok(snapshot.metadata().clone())
    }

    /// Refresh from the source now, bypassing freshness and the shared store
    ///
    /// Waits for a non-forced refresh that is already running, then runs its
    /// own. Joins a forced refresh that is already running.
    ///
    /// # Errors
    ///
    /// Returns the refresh error. The previous snapshot, if any, stays
    /// installed.
    pub async fn force_refresh(&self) -> ZoneResult<DatasetMetadata> {
        loop {
            let joined = self.start_refresh(true);
            if joined.forced {
                return joined.future.await.map(|s| s.metadata().clone());
            }
            // A regular refresh was already running; let it finish first
            let _ = joined.future.await;
        }
    }

    /// Drop the installed snapshot and clear the shared copy
    ///
    /// Returns whether the shared store accepted the clear.
    pub async fn invalidate(&self) -> bool {
        *self.inner.current.write() = None;
        tracing::info!("Zone cache invalidated");
        self.inner.store.clear().await
    }

    /// Start a background refresh if the snapshot is missing or stale
    ///
    /// Returns whether a new refresh was started.
    pub fn refresh_if_stale(&self) -> bool {
        let due = self
            .current()
            .map_or(true, |s| s.dataset().is_stale(self.inner.clock.now()));
        due && self.spawn_background_refresh()
    }

    /// Start a refresh without waiting for it
    ///
    /// Returns `false` if a refresh was already running.
    pub fn spawn_background_refresh(&self) -> bool {
        let joined = self.start_refresh(false);
        if joined.started {
            self.inner.counters.background.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Background refresh started");
        }
        joined.started
    }

    /// Periodically refresh stale data until the returned task is stopped
    #[must_use]
    pub fn start_refresh_ticker(&self) -> PeriodicTask {
        let cache = self.clone();
        PeriodicTask::spawn("zone-refresh", self.inner.config.ticker_interval, move || {
            let cache = cache.clone();
            async move {
                cache.refresh_if_stale();
            }
        })
    }

    /// Operational metrics
    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        let current = self.current();
        let meta = current.as_ref().map(|s| s.metadata());
        let counters = &self.inner.counters;

        CacheMetrics {
            is_initialized: current.is_some(),
            last_updated: meta.map(|m| m.loaded_at),
            next_refresh_due: meta.map(|m| m.next_refresh_at),
            feature_count: meta.map_or(0, |m| m.feature_count),
            version: meta.map(|m| m.version.clone()),
            content_hash: meta.map(|m| m.content_hash.clone()),
            is_stale: current
                .as_ref()
                .is_some_and(|s| s.dataset().is_stale(self.inner.clock.now())),
            is_refreshing: self.inner.flight.is_running(),
            refresh_count: counters.refreshes.load(Ordering::Relaxed),
            index_builds: counters.index_builds.load(Ordering::Relaxed),
            snapshot_adoptions: counters.adoptions.load(Ordering::Relaxed),
            failed_refreshes: counters.failures.load(Ordering::Relaxed),
            background_refreshes: counters.background.load(Ordering::Relaxed),
            last_refresh_error: self.inner.last_error.read().clone(),
            store_enabled: self.inner.store.is_enabled(),
            store_connected: self.inner.store.is_connected(),
        }
    }

    fn start_refresh(&self, forced: bool) -> Joined<Arc<ZoneSnapshot>> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .flight
            .join_or_start(forced, move || async move { inner.refresh(forced).await })
    }
}

impl std::fmt::Debug for ZoneCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneCache")
            .field("source", &self.inner.source.describe())
            .field("initialized", &self.current().is_some())
            .field("refreshing", &self.inner.flight.is_running())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Refresh
// =============================================================================

impl CacheInner {
    fn current(&self) -> Option<Arc<ZoneSnapshot>> {
        self.current.read().clone()
    }

    fn install(&self, snapshot: Arc<ZoneSnapshot>) {
        *self.current.write() = Some(snapshot);
    }

    async fn refresh(&self, forced: bool) -> ZoneResult<Arc<ZoneSnapshot>> {
        let result = self.run_pipeline(forced).await;
        match &result {
            Ok(_) => {
                *self.last_error.write() = None;
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                *self.last_error.write() = Some(e.to_string());
                match self.current() {
                    Some(previous) => tracing::warn!(
                        error = %e,
                        version = %previous.metadata().version,
                        "Zone refresh failed; continuing to serve previous dataset"
                    ),
                    None => tracing::error!(error = %e, "Zone refresh failed with no dataset loaded"),
                }
            }
        }
        result
    }

    async fn run_pipeline(&self, forced: bool) -> ZoneResult<Arc<ZoneSnapshot>> {
        let previous = self.current();

        if !forced {
            if let Some(snapshot) = &previous {
                if !snapshot.dataset().is_stale(self.clock.now()) {
                    return Ok(Arc::clone(snapshot));
                }
            }
            if let Some(adopted) = self.adopt_shared(previous.as_deref()).await {
                return Ok(adopted);
            }
        }

        let bytes = self.fetch_with_retry().await?;

        let id_property = self.config.id_property.clone();
        let ttl = self.config.ttl;
        let loaded_at = self.clock.now();
        let dataset = tokio::task::spawn_blocking(move || {
            let features = parse_feature_collection(&bytes, &id_property)?;
            Dataset::new(features, loaded_at, ttl)
        })
        .await??;

        let unchanged = previous
            .as_ref()
            .filter(|p| p.metadata().content_hash == dataset.metadata().content_hash);

        let snapshot = match unchanged {
            Some(previous) => {
                tracing::info!(
                    version = %previous.metadata().version,
                    "Zone dataset unchanged; renewing timestamps"
                );
                previous.with_dataset(previous.dataset().renewed(loaded_at, ttl))?
            }
            None => {
                let feature_count = dataset.metadata().feature_count;
                let snapshot =
                    tokio::task::spawn_blocking(move || ZoneSnapshot::build(dataset)).await??;
                self.counters.index_builds.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    features = feature_count,
                    version = %snapshot.metadata().version,
                    "Spatial index built"
                );
                snapshot
            }
        };

        let snapshot = Arc::new(snapshot);
        self.install(Arc::clone(&snapshot));
        self.counters.refreshes.fetch_add(1, Ordering::Relaxed);

        if self.store.is_enabled() && !self.store.save(&snapshot).await {
            tracing::debug!("Snapshot not shared; peers will refresh from source");
        }

        Ok(snapshot)
    }

    /// Adopt an unexpired snapshot from the shared store
    async fn adopt_shared(&self, previous: Option<&ZoneSnapshot>) -> Option<Arc<ZoneSnapshot>> {
        let stored = self.store.load().await?;
        if stored.snapshot.dataset().is_stale(self.clock.now()) {
            tracing::debug!("Shared snapshot is past due; refreshing from source");
            return None;
        }

        // Same content: keep our index, take the peer's timestamps
        let snapshot = match previous {
            Some(prev) if prev.metadata().content_hash == stored.snapshot.metadata().content_hash => {
                prev.with_dataset(stored.snapshot.dataset().clone()).ok()?
            }
            _ => stored.snapshot,
        };

        let snapshot = Arc::new(snapshot);
        self.install(Arc::clone(&snapshot));
        self.counters.adoptions.fetch_add(1, Ordering::Relaxed);
        self.counters.refreshes.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            version = %snapshot.metadata().version,
            features = snapshot.metadata().feature_count,
            written_by = %stored.written_by,
            "Adopted zone snapshot from shared store"
        );
        Some(snapshot)
    }

    async fn fetch_with_retry(&self) -> ZoneResult<Vec<u8>> {
        let retry = &self.config.retry;
        let attempts = retry.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            let result = match tokio::time::timeout(self.config.fetch_timeout, self.source.fetch()).await {
                Ok(result) => result,
                Err(_) => Err(ZoneError::Timeout(format!(
                    "fetch from {} exceeded {:?}",
                    self.source.describe(),
                    self.config.fetch_timeout
                ))),
            };

            match result {
                Ok(bytes) => return Ok(bytes),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %e,
                        "Zone dataset fetch failed"
                    );
                    if attempt + 1 < attempts {
                        tokio::time::sleep(retry.backoff_for_attempt(attempt)).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ZoneError::SourceUnavailable("no fetch attempted".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::config::RetryConfig;
    use crate::clock::ManualClock;
    use crate::store::{MemoryStore, SharedStore};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    const ZONE_A: &str = r#"{"type": "FeatureCollection", "features": [
        {"type": "Feature", "properties": {"GEOID": "A"},
         "geometry": {"type": "Polygon", "coordinates": [[[0,0],[0,10],[10,10],[10,0],[0,0]]]}}
    ]}"#;

    const ZONE_B: &str = r#"{"type": "FeatureCollection", "features": [
        {"type": "Feature", "properties": {"GEOID": "B"},
         "geometry": {"type": "Polygon", "coordinates": [[[20,20],[20,30],[30,30],[30,20],[20,20]]]}}
    ]}"#;

    /// Source returning scripted results, then a fallback document
    #[derive(Debug)]
    struct ScriptedSource {
        script: parking_lot::Mutex<VecDeque<ZoneResult<String>>>,
        fallback: parking_lot::Mutex<String>,
        fetches: AtomicU32,
        delay: Duration,
        gate: Option<Arc<Semaphore>>,
    }

    impl ScriptedSource {
        fn new(doc: &str) -> Self {
            Self {
                script: parking_lot::Mutex::new(VecDeque::new()),
                fallback: parking_lot::Mutex::new(doc.to_string()),
                fetches: AtomicU32::new(0),
                delay: Duration::ZERO,
                gate: None,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
            self.gate = Some(gate);
            self
        }

        fn then(self, result: ZoneResult<&str>) -> Self {
            self.script.lock().push_back(result.map(str::to_string));
            self
        }

        fn set_document(&self, doc: &str) {
            *self.fallback.lock() = doc.to_string();
        }

        fn fetches(&self) -> u32 {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DatasetSource for ScriptedSource {
        async fn fetch(&self) -> ZoneResult<Vec<u8>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().pop_front();
            match next {
                Some(result) => result.map(String::into_bytes),
                None => Ok(self.fallback.lock().clone().into_bytes()),
            }
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    struct Harness {
        cache: ZoneCache,
        source: Arc<ScriptedSource>,
        memory: MemoryStore,
        clock: Arc<ManualClock>,
    }

    fn config() -> CacheConfig {
        CacheConfig::default()
            .with_ttl(Duration::from_secs(60))
            .with_ticker_interval(Duration::from_secs(10))
            .with_retry(RetryConfig::default().without_jitter())
    }

    fn harness_with(source: ScriptedSource, memory: MemoryStore, clock: Arc<ManualClock>) -> Harness {
        let source = Arc::new(source);
        let store = DistributedCacheStore::new(
            SharedStore::Memory(memory.clone()),
            "oz",
            Duration::from_secs(60),
            clock.clone(),
        );
        let cache = ZoneCache::new(config(), source.clone(), store, clock.clone());
        Harness {
            cache,
            source,
            memory,
            clock,
        }
    }

    fn harness(source: ScriptedSource) -> Harness {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let memory = MemoryStore::new(clock.clone());
        harness_with(source, memory, clock)
    }

    fn point(lat: f64, lon: f64) -> Coordinates {
        Coordinates::new(lat, lon).unwrap()
    }

    // =========================================================================
    // First Fill
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_first_query_loads_dataset() {
        let h = harness(ScriptedSource::new(ZONE_A));
        assert!(!h.cache.metrics().is_initialized);

        let hit = h.cache.query(point(5.0, 5.0)).await.unwrap();
        assert!(hit.zone.in_zone);
        assert_eq!(hit.zone.zone_id.as_deref(), Some("A"));
        assert_eq!(hit.metadata.feature_count, 1);

        let miss = h.cache.query(point(15.0, 15.0)).await.unwrap();
        assert!(!miss.zone.in_zone);

        let metrics = h.cache.metrics();
        assert!(metrics.is_initialized);
        assert_eq!(metrics.index_builds, 1);
        assert_eq!(metrics.refresh_count, 1);
        assert_eq!(h.source.fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_first_fill_fetches_once() {
        let h = harness(ScriptedSource::new(ZONE_A).with_delay(Duration::from_millis(200)));

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let cache = h.cache.clone();
            tasks.push(tokio::spawn(async move { cache.ensure_fresh().await }));
        }

        let mut versions = Vec::new();
        for task in tasks {
            let snapshot = task.await.unwrap().unwrap();
            versions.push(snapshot.metadata().version.clone());
        }

        assert_eq!(h.source.fetches(), 1);
        assert_eq!(h.cache.metrics().index_builds, 1);
        assert!(versions.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_waiter_does_not_cancel_first_fill() {
        let h = harness(ScriptedSource::new(ZONE_A).with_delay(Duration::from_secs(5)));

        let waited = tokio::time::timeout(Duration::from_secs(1), h.cache.ensure_fresh()).await;
        assert!(waited.is_err());

        let snapshot = h.cache.ensure_fresh().await.unwrap();
        assert_eq!(snapshot.metadata().feature_count, 1);
        assert_eq!(h.source.fetches(), 1);
    }

    // =========================================================================
    // Refresh Semantics
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_refresh_skips_rebuild() {
        let h = harness(ScriptedSource::new(ZONE_A));
        let first = h.cache.initialize().await.unwrap();
        let first_snapshot = h.cache.current().unwrap();

        h.clock.advance(Duration::from_secs(30));
        let second = h.cache.force_refresh().await.unwrap();

        assert_eq!(second.version, first.version);
        assert_eq!(second.content_hash, first.content_hash);
        assert!(second.loaded_at > first.loaded_at);
        assert_eq!(h.cache.metrics().index_builds, 1);
        assert!(h.cache.current().unwrap().shares_index_with(&first_snapshot));
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_document_rebuilds() {
        let h = harness(ScriptedSource::new(ZONE_A));
        let first = h.cache.initialize().await.unwrap();

        h.source.set_document(ZONE_B);
        let second = h.cache.force_refresh().await.unwrap();

        assert_ne!(second.version, first.version);
        assert_eq!(h.cache.metrics().index_builds, 2);
        let hit = h.cache.query(point(25.0, 25.0)).await.unwrap();
        assert_eq!(hit.zone.zone_id.as_deref(), Some("B"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_query_serves_old_and_refreshes_once() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(ScriptedSource::new(ZONE_A).with_gate(gate.clone()));

        gate.add_permits(1);
        let first = h.cache.initialize().await.unwrap();
        assert_eq!(h.source.fetches(), 1);

        // One second past nextRefreshAt
        h.clock.advance(Duration::from_secs(61));

        let hit = tokio::time::timeout(Duration::from_millis(10), h.cache.query(point(5.0, 5.0)))
            .await
            .expect("stale query must not block")
            .unwrap();
        assert_eq!(hit.metadata.version, first.version);
        assert!(h.cache.metrics().is_refreshing);

        // Further stale reads join the same refresh
        h.cache.query(point(5.0, 5.0)).await.unwrap();
        h.cache.query(point(1.0, 1.0)).await.unwrap();
        assert_eq!(h.cache.metrics().background_refreshes, 1);

        gate.add_permits(1);
        while h.cache.metrics().is_refreshing {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert_eq!(h.source.fetches(), 2);
        let metrics = h.cache.metrics();
        assert!(!metrics.is_stale);
        assert_eq!(metrics.index_builds, 1);
    }

    // =========================================================================
    // Failure Handling
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let source = ScriptedSource::new(ZONE_A)
            .then(Err(ZoneError::SourceUnavailable("502".into())))
            .then(Err(ZoneError::SourceUnavailable("503".into())));
        let h = harness(source);

        assert!(h.cache.initialize().await.is_ok());
        assert_eq!(h.source.fetches(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_without_dataset_propagate() {
        let source = ScriptedSource::new(ZONE_A)
            .then(Err(ZoneError::SourceUnavailable("1".into())))
            .then(Err(ZoneError::SourceUnavailable("2".into())))
            .then(Err(ZoneError::SourceUnavailable("3".into())));
        let h = harness(source);

        let err = h.cache.initialize().await.unwrap_err();
        assert_eq!(err, ZoneError::SourceUnavailable("3".into()));
        assert_eq!(h.source.fetches(), 3);

        let metrics = h.cache.metrics();
        assert!(!metrics.is_initialized);
        assert_eq!(metrics.failed_refreshes, 1);
        assert!(metrics.last_refresh_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_dataset_not_retried() {
        let h = harness(ScriptedSource::new(r#"{"type": "FeatureCollection", "features": []}"#));

        let err = h.cache.initialize().await.unwrap_err();
        assert!(matches!(err, ZoneError::MalformedDataset(_)));
        assert_eq!(h.source.fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_previous_dataset() {
        let h = harness(ScriptedSource::new(ZONE_A));
        let first = h.cache.initialize().await.unwrap();

        h.source.set_document("not json");
        let err = h.cache.force_refresh().await.unwrap_err();
        assert!(matches!(err, ZoneError::MalformedDataset(_)));

        let hit = h.cache.query(point(5.0, 5.0)).await.unwrap();
        assert!(hit.zone.in_zone);
        assert_eq!(hit.metadata.version, first.version);

        let metrics = h.cache.metrics();
        assert_eq!(metrics.failed_refreshes, 1);
        assert!(metrics
            .last_refresh_error
            .as_deref()
            .is_some_and(|e| e.contains("Malformed")));

        h.source.set_document(ZONE_A);
        h.cache.force_refresh().await.unwrap();
        assert!(h.cache.metrics().last_refresh_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout_is_retried() {
        let h = harness(ScriptedSource::new(ZONE_A).with_delay(Duration::from_secs(120)));

        let err = h.cache.initialize().await.unwrap_err();
        assert!(matches!(err, ZoneError::Timeout(_)));
        assert_eq!(h.source.fetches(), 3);
    }

    // =========================================================================
    // Shared Store
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_peer_adopts_shared_snapshot() {
        let a = harness(ScriptedSource::new(ZONE_A));
        let published = a.cache.initialize().await.unwrap();

        let b = harness_with(
            ScriptedSource::new(ZONE_B),
            a.memory.clone(),
            a.clock.clone(),
        );
        let adopted = b.cache.initialize().await.unwrap();

        assert_eq!(adopted.version, published.version);
        assert_eq!(b.source.fetches(), 0);
        let metrics = b.cache.metrics();
        assert_eq!(metrics.snapshot_adoptions, 1);
        assert_eq!(metrics.index_builds, 0);
        assert!(b.cache.query(point(5.0, 5.0)).await.unwrap().zone.in_zone);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_refresh_bypasses_shared_snapshot() {
        let a = harness(ScriptedSource::new(ZONE_A));
        a.cache.initialize().await.unwrap();

        let b = harness_with(
            ScriptedSource::new(ZONE_B),
            a.memory.clone(),
            a.clock.clone(),
        );
        b.cache.force_refresh().await.unwrap();

        assert_eq!(b.source.fetches(), 1);
        let hit = b.cache.query(point(25.0, 25.0)).await.unwrap();
        assert_eq!(hit.zone.zone_id.as_deref(), Some("B"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_store_falls_back_to_source() {
        let h = harness(ScriptedSource::new(ZONE_A));
        h.cache.initialize().await.unwrap();

        h.memory.set_connected(false);
        h.clock.advance(Duration::from_secs(61));
        h.source.set_document(ZONE_B);

        let refreshed = h.cache.force_refresh().await.unwrap();
        assert_eq!(refreshed.feature_count, 1);
        assert_eq!(h.source.fetches(), 2);
        let metrics = h.cache.metrics();
        assert!(!metrics.store_connected);
        assert!(metrics.last_refresh_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_reload() {
        let h = harness(ScriptedSource::new(ZONE_A));
        h.cache.initialize().await.unwrap();
        assert!(!h.memory.is_empty());

        assert!(h.cache.invalidate().await);
        assert!(h.cache.current().is_none());
        assert!(h.memory.is_empty());

        h.cache.query(point(5.0, 5.0)).await.unwrap();
        assert_eq!(h.source.fetches(), 2);
    }

    // =========================================================================
    // Ticker
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_ticker_refreshes_stale_dataset() {
        let h = harness(ScriptedSource::new(ZONE_A));
        h.cache.initialize().await.unwrap();
        let ticker = h.cache.start_refresh_ticker();

        // Fresh: ticks do nothing
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(h.source.fetches(), 1);

        h.clock.advance(Duration::from_secs(61));
        tokio::time::sleep(Duration::from_secs(10)).await;
        while h.cache.metrics().is_refreshing {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(h.source.fetches(), 2);
        assert!(!h.cache.metrics().is_stale);

        ticker.stop().await;
        h.clock.advance(Duration::from_secs(61));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.source.fetches(), 2);
    }
}
