//! In-process key/value store with per-key TTL
//!
//! Used for single-instance deployments and as the shared store in tests.
//! Clones share the same map, so two caches built over clones of one
//! `MemoryStore` behave like two instances sharing one Redis.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::clock::{to_chrono, SharedClock, SystemClock};
use crate::error::{ZoneError, ZoneResult};

#[derive(Clone, Debug)]
struct MemoryEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug)]
struct Inner {
    entries: DashMap<String, MemoryEntry>,
    connected: AtomicBool,
    clock: SharedClock,
}

/// Shared in-memory store
#[derive(Clone, Debug)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    /// Create an empty store reading time from `clock`
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                connected: AtomicBool::new(true),
                clock,
            }),
        }
    }

    /// Simulate losing or regaining the connection
    pub fn set_connected(&self, connected: bool) {
        let was = self.inner.connected.swap(connected, Ordering::AcqRel);
        if was != connected {
            tracing::info!(connected, "Memory store connection state changed");
        }
    }

    /// Whether the store is reachable
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Number of live keys
    #[must_use]
    pub fn len(&self) -> usize {
        let now = self.inner.clock.now();
        self.inner
            .entries
            .iter()
            .filter(|e| !e.value().is_expired(now))
            .count()
    }

    /// Whether there are no live keys
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_connected(&self) -> ZoneResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ZoneError::StoreUnavailable(
                "memory store disconnected".to_string(),
            ))
        }
    }

    /// Read a key
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` while disconnected.
    pub fn get(&self, key: &str) -> ZoneResult<Option<String>> {
        self.ensure_connected()?;
        let now = self.inner.clock.now();
        let hit = self.inner.entries.get(key).map(|e| e.value().clone());
        match hit {
            Some(entry) if entry.is_expired(now) => {
                self.inner.entries.remove_if(key, |_, e| e.is_expired(now));
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value)),
            None => Ok(None),
        }
    }

    /// Write a key with a TTL
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` while disconnected.
    pub fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> ZoneResult<()> {
        self.ensure_connected()?;
        let expires_at = self.inner.clock.now() + to_chrono(ttl);
        self.inner.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    /// Delete a key, returning whether it existed
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` while disconnected.
    pub fn del(&self, key: &str) -> ZoneResult<bool> {
        self.ensure_connected()?;
        let now = self.inner.clock.now();
        Ok(self
            .inner
            .entries
            .remove(key)
            .is_some_and(|(_, e)| !e.is_expired(now)))
    }

    /// Increment a counter and reset its expiry in one step
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` while disconnected.
    pub fn incr_with_expiry(&self, key: &str, ttl: Duration) -> ZoneResult<u64> {
        self.ensure_connected()?;
        let now = self.inner.clock.now();
        let expires_at = Some(now + to_chrono(ttl));

        let mut entry = self
            .inner
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry {
                value: "0".to_string(),
                expires_at,
            });
        let current = if entry.is_expired(now) {
            0
        } else {
            entry.value.parse::<u64>().map_err(|_| {
                ZoneError::StoreUnavailable(format!("value at {key} is not an integer"))
            })?
        };
        let next = current.saturating_add(1);
        entry.value = next.to_string();
        entry.expires_at = expires_at;
        Ok(next)
    }

    /// Drop expired keys
    pub fn purge_expired(&self) -> usize {
        let now = self.inner.clock.now();
        let before = self.inner.entries.len();
        self.inner.entries.retain(|_, e| !e.is_expired(now));
        before.saturating_sub(self.inner.entries.len())
    }
}
