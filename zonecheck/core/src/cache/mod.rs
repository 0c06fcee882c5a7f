//! Zone dataset cache
//!
//! - [`config`] - TTL, ticker and retry settings
//! - [`source`] - where raw GeoJSON comes from
//! - [`single_flight`] - one refresh at a time, shared by all callers
//! - [`zone_cache`] - snapshot lifecycle, stale-while-revalidate, metrics

pub mod config;
pub mod single_flight;
pub mod source;
pub mod zone_cache;

pub use config::{CacheConfig, RetryConfig};
pub use single_flight::SingleFlight;
pub use source::{DatasetSource, FileSource, HttpSource, UnconfiguredSource};
pub use zone_cache::{CacheMetrics, CachedMatch, ZoneCache};
