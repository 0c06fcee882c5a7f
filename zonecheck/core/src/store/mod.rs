//! Shared key/value store
//!
//! ```text
//! SharedStore (enum dispatch)
//!   ├── Memory(MemoryStore)   <- in-process DashMap with TTL
//!   ├── Redis(RedisStore)     <- ConnectionManager-based, feature "redis-store"
//!   └── Disabled              <- every operation reports StoreUnavailable
//! ```
//!
//! The store backs two independent features: distributed cache snapshots
//! ([`DistributedCacheStore`]) and distributed rate-limit counters. Both treat
//! [`ZoneError::StoreUnavailable`] as a signal to degrade, never as a failure
//! to surface.

pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis_store;
pub mod snapshot;

use std::time::Duration;

pub use memory::MemoryStore;
#[cfg(feature = "redis-store")]
pub use redis_store::RedisStore;
pub use snapshot::{DistributedCacheStore, StoredSnapshot};

use crate::error::{ZoneError, ZoneResult};
use crate::task::PeriodicTask;

/// Key/value provider shared by the cache and the rate limiter
#[derive(Clone, Debug)]
pub enum SharedStore {
    /// In-process store
    Memory(MemoryStore),
    /// Redis store
    #[cfg(feature = "redis-store")]
    Redis(RedisStore),
    /// No store configured
    Disabled,
}

impl SharedStore {
    /// Build a store from an optional URL
    ///
    /// `memory://` selects the in-process store. `redis://` and `rediss://`
    /// need the `redis-store` feature. `None` disables the store.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for an unsupported scheme or an invalid URL.
    pub fn from_url(url: Option<&str>, command_timeout: Duration) -> ZoneResult<Self> {
        let Some(url) = url.filter(|u| !u.trim().is_empty()) else {
            return Ok(Self::Disabled);
        };

        if url.starts_with("memory://") {
            return Ok(Self::Memory(MemoryStore::default()));
        }

        if url.starts_with("redis://") || url.starts_with("rediss://") {
            #[cfg(feature = "redis-store")]
            {
                return RedisStore::open(url, command_timeout).map(Self::Redis);
            }
            #[cfg(not(feature = "redis-store"))]
            {
                let _ = command_timeout;
                return Err(ZoneError::Configuration(
                    "Redis URL configured but the redis-store feature is disabled".to_string(),
                ));
            }
        }

        Err(ZoneError::Configuration(format!(
            "unsupported store URL scheme: {url}"
        )))
    }

    /// Provider name for logs and metrics
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            #[cfg(feature = "redis-store")]
            Self::Redis(_) => "redis",
            Self::Disabled => "disabled",
        }
    }

    /// Whether a store is configured at all
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    /// Live connection state
    #[must_use]
    pub fn is_connected(&self) -> bool {
        match self {
            Self::Memory(store) => store.is_connected(),
            #[cfg(feature = "redis-store")]
            Self::Redis(store) => store.is_connected(),
            Self::Disabled => false,
        }
    }

    fn disabled() -> ZoneError {
        ZoneError::StoreUnavailable("no shared store configured".to_string())
    }

    /// Read a key
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` on any store failure.
    pub async fn get(&self, key: &str) -> ZoneResult<Option<String>> {
        match self {
            Self::Memory(store) => store.get(key),
            #[cfg(feature = "redis-store")]
            Self::Redis(store) => store.get(key).await,
            Self::Disabled => Err(Self::disabled()),
        }
    }

    /// Write a key with a TTL
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` on any store failure.
    pub async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> ZoneResult<()> {
        match self {
            Self::Memory(store) => store.set_ex(key, value, ttl),
            #[cfg(feature = "redis-store")]
            Self::Redis(store) => store.set_ex(key, value, ttl).await,
            Self::Disabled => Err(Self::disabled()),
        }
    }

    /// Delete a key
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` on any store failure.
    pub async fn del(&self, key: &str) -> ZoneResult<bool> {
        match self {
            Self::Memory(store) => store.del(key),
            #[cfg(feature = "redis-store")]
            Self::Redis(store) => store.del(key).await,
            Self::Disabled => Err(Self::disabled()),
        }
    }

    /// Atomically increment a counter and set its expiry
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` on any store failure.
    pub async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> ZoneResult<u64> {
        match self {
            Self::Memory(store) => store.incr_with_expiry(key, ttl),
            #[cfg(feature = "redis-store")]
            Self::Redis(store) => store.incr_with_expiry(key, ttl).await,
            Self::Disabled => Err(Self::disabled()),
        }
    }

    /// Drop expired keys held in-process
    ///
    /// Redis expires keys itself, so only the memory store has work to do.
    pub fn purge_expired(&self) -> usize {
        match self {
            Self::Memory(store) => store.purge_expired(),
            _ => 0,
        }
    }

    /// Round-trip to refresh the connection state
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the store cannot be reached.
    pub async fn ping(&self) -> ZoneResult<()> {
        match self {
            Self::Memory(store) => {
                if store.is_connected() {
                    store.purge_expired();
                    Ok(())
                } else {
                    Err(ZoneError::StoreUnavailable(
                        "memory store disconnected".to_string(),
                    ))
                }
            }
            #[cfg(feature = "redis-store")]
            Self::Redis(store) => store.ping().await,
            Self::Disabled => Err(Self::disabled()),
        }
    }

    /// Probe the store every `period` so the connection state stays current
    /// between requests
    #[must_use]
    pub fn start_probe(&self, period: Duration) -> Option<PeriodicTask> {
        if !self.is_enabled() {
            return None;
        }
        let store = self.clone();
        Some(PeriodicTask::spawn("store-probe", period, move || {
            let store = store.clone();
            async move {
                if let Err(e) = store.ping().await {
                    tracing::warn!(store = store.kind(), error = %e, "Shared store probe failed");
                }
            }
        }))
    }
}
