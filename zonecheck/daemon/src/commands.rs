//! Command implementations
//!
//! Results go to stdout as pretty JSON so they can be piped into `jq`; logs
//! go to stderr.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use zonecheck_core::routing::FeatureFlag;
use zonecheck_core::{BackendSlot, CacheMetrics, RateLimiterStats, ServiceMetrics, ZoneService};

/// Everything `status` reports
#[derive(Debug, Serialize)]
struct StatusReport {
    cache: Option<CacheMetrics>,
    backends: ServiceMetrics,
    rate_limit: RateLimiterStats,
    distributed_rate_limit: bool,
    flags: Vec<FeatureFlag>,
}

#[derive(Debug, Serialize)]
struct WarmReport {
    ready: Vec<BackendSlot>,
    cache: Option<CacheMetrics>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to encode output")?;
    println!("{text}");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
    }
    Ok(())
}

/// Warm up, run background tasks and block until a shutdown signal
pub async fn serve(service: &ZoneService) -> Result<()> {
    let ready = service.warm().await;
    if ready.is_empty() {
        warn!("No backend ready after warm-up; serving will retry on demand");
    }

    let tasks = service.start_background_tasks();
    info!(tasks = ?tasks.names(), "Zonecheck serving");

    let waited = wait_for_shutdown().await;

    tasks.stop().await;
    info!("Zonecheck stopped cleanly");
    waited
}

/// Look up one point
pub async fn check(
    service: &ZoneService,
    identity: &str,
    lat: f64,
    lon: f64,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let result = match timeout_ms {
        Some(ms) => {
            service
                .check_point_with_timeout(identity, lat, lon, Duration::from_millis(ms))
                .await
        }
        None => service.check_point(identity, lat, lon).await,
    };
    let check = result.with_context(|| format!("Point check failed for ({lat}, {lon})"))?;
    print_json(&check)
}

/// Load the dataset and report which backends are ready
pub async fn warm(service: &ZoneService) -> Result<()> {
    let ready = service.warm().await;
    print_json(&WarmReport {
        ready,
        cache: service.cache_metrics(),
    })
}

/// Reload the dataset from its source
pub async fn refresh(service: &ZoneService) -> Result<()> {
    let metadata = service
        .force_refresh()
        .await
        .context("Dataset refresh failed")?;
    print_json(&metadata)
}

/// Print metrics
pub fn status(service: &ZoneService) -> Result<()> {
    print_json(&StatusReport {
        cache: service.cache_metrics(),
        backends: service.health_metrics(),
        rate_limit: service.rate_limit_stats(),
        distributed_rate_limit: service.limiter().is_distributed(),
        flags: service.flags().all(),
    })
}

/// Drop the cached dataset
pub async fn invalidate(service: &ZoneService) -> Result<()> {
    let cleared = service
        .invalidate()
        .await
        .context("Invalidate failed")?;
    print_json(&serde_json::json!({ "invalidated": true, "shared_store_cleared": cleared }))
}
