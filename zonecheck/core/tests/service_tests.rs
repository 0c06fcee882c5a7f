//! End-to-end tests for the zone service
//!
//! These wire real services from configuration against the fixture dataset
//! in `tests/fixtures/zones.geojson`, an in-process shared store and, where
//! needed, a canned HTTP server standing in for the remote query service.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use zonecheck_core::config::load_config_with_env;
use zonecheck_core::{
    BackendSlot, BackendState, Coordinates, DatasetLocation, Geocoder, ManualClock, MemoryStore,
    RateLimitPolicy, RemoteConfig, SharedClock, SharedStore, ZoneCheckConfigFile, ZoneError,
    ZoneResult, ZoneService,
};

// =============================================================================
// Test Infrastructure
// =============================================================================

const START: i64 = 1_700_000_040;

fn fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("zones.geojson")
}

fn fixture_config() -> ZoneCheckConfigFile {
    let mut config = ZoneCheckConfigFile::default();
    config.dataset = DatasetLocation::File(fixture_path());
    config.resilience.attempt_delay = Duration::from_millis(1);
    config
}

/// One clock and one store shared by every service in a test, as if the
/// instances ran side by side against the same Redis
struct Cluster {
    clock: Arc<ManualClock>,
    memory: MemoryStore,
}

impl Cluster {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::at_unix(START));
        let shared: SharedClock = clock.clone();
        Self {
            clock,
            memory: MemoryStore::new(shared),
        }
    }

    fn service(&self, config: ZoneCheckConfigFile) -> ZoneService {
        let clock: SharedClock = self.clock.clone();
        ZoneService::builder(config)
            .with_clock(clock)
            .with_store(SharedStore::Memory(self.memory.clone()))
            .build()
            .unwrap()
    }
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut request = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = socket.read(&mut buf).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        request.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&request).to_string();
        if let Some(split) = text.find("\r\n\r\n") {
            let length = text[..split]
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    if name.eq_ignore_ascii_case("content-length") {
                        value.trim().parse::<usize>().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0);
            if request.len() >= split + 4 + length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&request).to_string()
}

const REMOTE_GEOCODE: &str = r#"{"lat":2.0,"lon":3.0,"display_name":"Remote Place"}"#;

/// Serve canned remote-service responses until the test ends
async fn spawn_remote() -> String {
    spawn_remote_geocoding(REMOTE_GEOCODE).await
}

/// Like [`spawn_remote`], answering `/api/geocode` with `geocode_body`
async fn spawn_remote_geocoding(geocode_body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let request = read_request(&mut socket).await;
                let body = if request.starts_with("POST /api/check-point") {
                    r#"{"isInZone":true,"zoneId":"REMOTE-1","datasetVersion":"v1-remote","datasetLastUpdated":"2024-01-01T00:00:00Z","featureCount":42}"#
                } else if request.starts_with("POST /api/geocode") {
                    geocode_body
                } else {
                    r#"{"status":"ok"}"#
                };
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    url
}

// =============================================================================
// Lookup Tests
// =============================================================================

#[tokio::test]
async fn test_fixture_lookups() {
    let cluster = Cluster::new();
    let service = cluster.service(fixture_config());

    let zone = |lat: f64, lon: f64| {
        let service = &service;
        async move {
            service
                .check_point("web-app", lat, lon)
                .await
                .unwrap()
                .zone_id
        }
    };

    assert_eq!(zone(2.0, 2.0).await.as_deref(), Some("OZ-A"));
    // Inside the hole
    assert_eq!(zone(5.0, 5.0).await, None);
    // Boundaries count as inside
    assert_eq!(zone(0.0, 5.0).await.as_deref(), Some("OZ-A"));
    assert_eq!(zone(5.0, 4.0).await.as_deref(), Some("OZ-A"));
    // Second member of a MultiPolygon
    assert_eq!(zone(2.0, 28.0).await.as_deref(), Some("OZ-B"));
    // Gap between the members
    assert_eq!(zone(2.0, 25.5).await, None);
    // Identifier from the feature id
    assert_eq!(zone(-7.0, -7.0).await.as_deref(), Some("tract-3"));
    assert_eq!(zone(50.0, 50.0).await, None);

    let metrics = service.cache_metrics().unwrap();
    assert_eq!(metrics.feature_count, 3);
    assert_eq!(metrics.index_builds, 1);
    assert_eq!(metrics.refresh_count, 1);
}

#[tokio::test]
async fn test_result_carries_dataset_metadata() {
    let cluster = Cluster::new();
    let service = cluster.service(fixture_config());

    let check = service.check_point("web-app", 2.0, 2.0).await.unwrap();
    let metrics = service.cache_metrics().unwrap();

    assert_eq!(Some(check.dataset_version.clone()), metrics.version);
    assert!(check.dataset_version.starts_with("v1-"));
    assert_eq!(check.feature_count, 3);
    assert_eq!(check.dataset_last_updated.timestamp(), START);
}

#[tokio::test]
async fn test_invalid_coordinates_rejected() {
    let cluster = Cluster::new();
    let service = cluster.service(fixture_config());

    for (lat, lon) in [(90.5, 0.0), (0.0, -180.5), (f64::NAN, 0.0)] {
        let err = service.check_point("web-app", lat, lon).await.unwrap_err();
        assert!(matches!(err, ZoneError::Validation(_)), "{lat},{lon}: {err}");
    }
    // Nothing was loaded for rejected input
    assert!(!service.cache_metrics().unwrap().is_initialized);
}

// =============================================================================
// Shared Store Tests
// =============================================================================

#[tokio::test]
async fn test_peer_adopts_snapshot() {
    let cluster = Cluster::new();
    let first = cluster.service(fixture_config());
    let second = cluster.service(fixture_config());

    assert_eq!(first.warm().await, vec![BackendSlot::Primary]);
    assert_eq!(second.warm().await, vec![BackendSlot::Primary]);

    let a = first.cache_metrics().unwrap();
    let b = second.cache_metrics().unwrap();
    assert_eq!(a.version, b.version);
    assert_eq!(a.index_builds, 1);
    assert_eq!(b.index_builds, 0);
    assert_eq!(b.snapshot_adoptions, 1);

    let check = second.check_point("web-app", 2.0, 28.0).await.unwrap();
    assert_eq!(check.zone_id.as_deref(), Some("OZ-B"));
}

#[tokio::test]
async fn test_invalidate_clears_shared_snapshot() {
    let cluster = Cluster::new();
    let first = cluster.service(fixture_config());
    first.warm().await;
    assert!(!cluster.memory.is_empty());

    assert!(first.invalidate().await.unwrap());

    let second = cluster.service(fixture_config());
    second.warm().await;
    let metrics = second.cache_metrics().unwrap();
    assert_eq!(metrics.snapshot_adoptions, 0);
    assert_eq!(metrics.index_builds, 1);
}

#[tokio::test]
async fn test_stale_dataset_refreshed_from_source() {
    let cluster = Cluster::new();
    let mut config = fixture_config();
    config.cache.ttl = Duration::from_secs(60);
    let service = cluster.service(config);

    service.warm().await;
    let before = service.cache_metrics().unwrap();

    cluster.clock.advance(Duration::from_secs(61));
    assert!(service.cache_metrics().unwrap().is_stale);

    let meta = service.force_refresh().await.unwrap();
    let after = service.cache_metrics().unwrap();
    assert_eq!(Some(meta.version), before.version);
    assert!(!after.is_stale);
    // Same content: timestamps renewed, index kept
    assert_eq!(after.index_builds, 1);
    assert_eq!(meta.loaded_at.timestamp(), START + 61);
}

// =============================================================================
// Rate Limiting Tests
// =============================================================================

#[tokio::test]
async fn test_rate_limit_shared_between_instances() {
    let cluster = Cluster::new();
    let mut config = fixture_config();
    config.rate_limit = config
        .rate_limit
        .with_policy("web-app", RateLimitPolicy::new(60, 3, "ratelimit:webapp"));

    let first = cluster.service(config.clone());
    let second = cluster.service(config);

    first.check_point("web-app", 2.0, 2.0).await.unwrap();
    second.check_point("web-app", 2.0, 2.0).await.unwrap();
    first.check_point("web-app", 2.0, 2.0).await.unwrap();

    let err = second.check_point("web-app", 2.0, 2.0).await.unwrap_err();
    match err {
        ZoneError::RateLimitExceeded {
            limit,
            remaining,
            reset_at,
        } => {
            assert_eq!(limit, 3);
            assert_eq!(remaining, 0);
            assert_eq!(reset_at.timestamp(), START + 60);
        }
        other => panic!("expected RateLimitExceeded, got {other:?}"),
    }

    // Other identities have their own quota
    second.check_point("mcp-server", 2.0, 2.0).await.unwrap();

    // Next window
    cluster.clock.advance(Duration::from_secs(60));
    first.check_point("web-app", 2.0, 2.0).await.unwrap();
}

#[tokio::test]
async fn test_store_outage_fails_open() {
    let cluster = Cluster::new();
    let mut config = fixture_config();
    config.rate_limit = config
        .rate_limit
        .with_policy("web-app", RateLimitPolicy::new(60, 1, "ratelimit:webapp"));
    let service = cluster.service(config);

    service.warm().await;
    cluster.memory.set_connected(false);

    for _ in 0..3 {
        let check = service.check_point("web-app", 2.0, 2.0).await.unwrap();
        assert!(check.is_in_zone);
    }

    let stats = service.rate_limit_stats();
    assert_eq!(stats.failed_open, 3);
    assert_eq!(stats.rejected, 0);
    assert!(!service.cache_metrics().unwrap().store_connected);
}

// =============================================================================
// Routing Tests
// =============================================================================

#[tokio::test]
async fn test_falls_back_to_remote_without_dataset() {
    let remote_url = spawn_remote().await;
    let cluster = Cluster::new();

    let mut config = ZoneCheckConfigFile::default();
    config.resilience.attempt_delay = Duration::from_millis(1);
    config.remote = Some(RemoteConfig {
        url: remote_url,
        api_key: Some("test-key".to_string()),
        timeout: Duration::from_secs(5),
    });
    let service = cluster.service(config);

    let check = service.check_point("mcp-server", 2.0, 2.0).await.unwrap();
    assert_eq!(check.zone_id.as_deref(), Some("REMOTE-1"));
    assert_eq!(check.feature_count, 42);

    let health = service.health_metrics();
    assert_eq!(health.active, Some(BackendSlot::Secondary));
    assert_eq!(health.primary.state, BackendState::Degraded);
    assert_eq!(health.primary.health.consecutive_failures, 1);

    // No local geocoder either; the remote one answers
    let coords = service.geocode("1 Main St").await.unwrap();
    assert_eq!((coords.latitude, coords.longitude), (2.0, 3.0));
}

#[tokio::test]
async fn test_flag_switches_preferred_backend() {
    let remote_url = spawn_remote().await;
    let cluster = Cluster::new();

    let mut config = fixture_config();
    config.remote = Some(RemoteConfig {
        url: remote_url,
        api_key: None,
        timeout: Duration::from_secs(5),
    });
    let service = cluster.service(config);

    let ready = service.warm().await;
    assert_eq!(ready, vec![BackendSlot::Primary, BackendSlot::Secondary]);

    let local = service.check_point("web-app", 2.0, 2.0).await.unwrap();
    assert_eq!(local.zone_id.as_deref(), Some("OZ-A"));

    let flag = service.flags().set_use_remote_service(true, "ops@example.com");
    assert!(flag.enabled);
    assert_eq!(flag.updated_by, "ops@example.com");

    let remote = service.check_point("web-app", 2.0, 2.0).await.unwrap();
    assert_eq!(remote.zone_id.as_deref(), Some("REMOTE-1"));
    assert_eq!(service.health_metrics().preferred, BackendSlot::Secondary);
}

#[derive(Debug)]
struct LocalGeocoder;

#[async_trait]
impl Geocoder for LocalGeocoder {
    async fn geocode(&self, _address: &str) -> ZoneResult<Coordinates> {
        Coordinates::new(5.0, 5.0)
    }
}

#[tokio::test]
async fn test_remote_out_of_range_geocode_falls_back_to_local() {
    let remote_url = spawn_remote_geocoding(r#"{"lat":123.0,"lon":0.0}"#).await;
    let cluster = Cluster::new();

    let mut config = fixture_config();
    config.use_remote_service = true;
    config.remote = Some(RemoteConfig {
        url: remote_url,
        api_key: None,
        timeout: Duration::from_secs(5),
    });
    let clock: SharedClock = cluster.clock.clone();
    let service = ZoneService::builder(config)
        .with_clock(clock)
        .with_store(SharedStore::Memory(cluster.memory.clone()))
        .with_geocoder(Arc::new(LocalGeocoder))
        .build()
        .unwrap();

    let coords = service.geocode("1 Main St").await.unwrap();
    assert_eq!((coords.latitude, coords.longitude), (5.0, 5.0));

    let health = service.health_metrics();
    assert_eq!(health.preferred, BackendSlot::Secondary);
    assert_eq!(health.active, Some(BackendSlot::Primary));
    let remote = health.secondary.unwrap();
    assert_eq!(remote.health.consecutive_failures, 1);
    assert_eq!(remote.health.total_failures, 1);
    assert_eq!(remote.state, BackendState::Degraded);
    assert_eq!(health.primary.health.total_failures, 0);
}

// =============================================================================
// Configuration Tests
// =============================================================================

#[tokio::test]
async fn test_service_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[source]
file = '{}'

[store]
url = "memory://"

[rate_limit.policies.web-app]
max_requests = 2
"#,
        fixture_path().display()
    )
    .unwrap();

    let config = load_config_with_env(Some(file.path().to_path_buf()), |_| None).unwrap();
    let service = ZoneService::from_config(config).unwrap();

    let check = service.check_point("web-app", 2.0, 2.0).await.unwrap();
    assert_eq!(check.zone_id.as_deref(), Some("OZ-A"));
    service.check_point("web-app", 2.0, 2.0).await.unwrap();

    // Two per minute; a third call in the same window is rejected unless the
    // wall clock just crossed a window boundary
    let third = service.check_point("web-app", 2.0, 2.0).await;
    if let Err(err) = third {
        assert!(matches!(err, ZoneError::RateLimitExceeded { limit: 2, .. }));
    }

    let tasks = service.start_background_tasks();
    assert_eq!(tasks.len(), 3);
    tasks.stop().await;
}
