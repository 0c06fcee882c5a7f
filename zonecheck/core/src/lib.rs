//! Zonecheck Core - point-in-zone lookups over a refreshed GeoJSON dataset
//!
//! Answers "is this point inside one of the zones?" for a FeatureCollection
//! of zone boundaries, with a spatial index that is loaded, refreshed,
//! persisted to a shared store and restored by peers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         ZoneService                           │
//! │   RateLimiter ──> Coordinates ──> ResilientQueryService       │
//! │                                      │            │           │
//! │                               ┌──────┘            └──────┐    │
//! │                               ▼                          ▼    │
//! │                        LocalBackend               RemoteBackend│
//! │                               │                     (HTTP)    │
//! │                           ZoneCache                           │
//! │              ┌────────────────┼───────────────┐               │
//! │              ▼                ▼               ▼               │
//! │        DatasetSource    ZoneSnapshot   DistributedCacheStore  │
//! │        (HTTP / file)   (SpatialIndex)       (SharedStore)     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`ZoneService`]: composition root and caller-facing operations
//! - [`ZoneCache`]: snapshot lifecycle with single-flight refresh
//! - [`SpatialIndex`]: packed R-tree over feature bounding boxes
//! - [`RateLimiter`]: fixed-window limits per caller identity
//! - [`ResilientQueryService`]: health-based failover between backends
//!
//! # Quick Start
//!
//! ```ignore
//! use zonecheck_core::{load_config, ZoneService};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config()?;
//!     let service = ZoneService::from_config(config)?;
//!     service.warm().await;
//!
//!     let check = service.check_point("web-app", 40.7128, -74.0060).await?;
//!     println!("in zone: {}", check.is_in_zone);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`spatial`]: coordinates, GeoJSON features, the spatial index
//! - [`dataset`]: versioned datasets and installable snapshots
//! - [`cache`]: dataset sources and the zone cache
//! - [`store`]: shared key/value store and snapshot persistence
//! - [`rate_limit`]: fixed-window rate limiting
//! - [`routing`]: backends, health, feature flags, failover
//! - [`config`]: TOML and environment configuration
//! - [`service`]: the composition root
//! - [`task`]: stoppable periodic tasks
//! - [`clock`]: injectable time

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod clock;
pub mod config;
pub mod dataset;
pub mod error;
pub mod rate_limit;
pub mod routing;
pub mod service;
pub mod spatial;
pub mod store;
pub mod task;

// Re-exports for convenience
pub use cache::{CacheConfig, CacheMetrics, DatasetSource, RetryConfig, ZoneCache};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use dataset::{Dataset, DatasetMetadata, ZoneMatch, ZoneSnapshot};
pub use error::{ErrorKind, ZoneError, ZoneResult};
pub use spatial::{Coordinates, Feature, SpatialIndex};
pub use store::{DistributedCacheStore, MemoryStore, SharedStore};
pub use task::PeriodicTask;

// Rate limiting exports
pub use rate_limit::{
    RateLimitConfig, RateLimitDecision, RateLimitPolicy, RateLimiter, RateLimiterStats,
};

// Routing exports
pub use routing::{
    Backend, BackendSlot, BackendState, FeatureFlags, Geocoder, HealthConfig, PointCheck,
    ResilientQueryService, ServiceMetrics, ZoneBackend,
};

// Service exports
pub use service::{BackgroundTasks, ZoneService, ZoneServiceBuilder};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, DatasetLocation, RemoteConfig, ZoneCheckConfigFile, ZoneCheckToml,
};
