//! Zone cache configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::spatial::DEFAULT_ID_PROPERTY;

// =============================================================================
// Retry
// =============================================================================

/// Bounded retry with exponential backoff for dataset fetches
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first
    pub max_attempts: u32,

    /// Delay after the first failed attempt
    pub initial_backoff_ms: u64,

    /// Maximum delay between attempts
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    pub backoff_multiplier: f32,

    /// Add up to 25% jitter
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Backoff after failed attempt N (0-indexed)
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_backoff_ms as f64 * f64::from(self.backoff_multiplier).powi(exponent);
        let capped = base.min(self.max_backoff_ms as f64);

        let duration_ms = if self.use_jitter {
            let jitter = rand::random::<f64>() * 0.25;
            (capped * (1.0 + jitter)) as u64
        } else {
            capped as u64
        };

        Duration::from_millis(duration_ms)
    }

    /// Disable jitter
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }
}

// =============================================================================
// Cache
// =============================================================================

/// Zone cache behaviour
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How long a dataset is fresh; also the shared snapshot TTL
    pub ttl: Duration,

    /// How often the background ticker checks for staleness
    pub ticker_interval: Duration,

    /// Per-attempt fetch timeout
    pub fetch_timeout: Duration,

    /// Property holding the zone identifier
    pub id_property: String,

    /// Key prefix for shared snapshots
    pub store_prefix: String,

    /// Fetch retry policy
    pub retry: RetryConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            ticker_interval: Duration::from_secs(5 * 60),
            fetch_timeout: Duration::from_secs(60),
            id_property: DEFAULT_ID_PROPERTY.to_string(),
            store_prefix: "oz".to_string(),
            retry: RetryConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the freshness TTL
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the ticker interval
    #[must_use]
    pub fn with_ticker_interval(mut self, interval: Duration) -> Self {
        self.ticker_interval = interval;
        self
    }

    /// Set the per-attempt fetch timeout
    #[must_use]
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Set the zone identifier property
    #[must_use]
    pub fn with_id_property(mut self, property: impl Into<String>) -> Self {
        self.id_property = property.into();
        self
    }

    /// Set the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}
