//! Distributed cache snapshots
//!
//! A snapshot (dataset, spatial index and metadata) is written as one JSON
//! document under `{prefix}:snapshot` with a TTL equal to the refresh TTL.
//! Keeping everything under a single key means a reader can never combine an
//! index from one generation with features from another.
//!
//! Every operation is best-effort: failures are logged and reported as
//! `false`/`None`, never as errors.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::SharedStore;
use crate::clock::SharedClock;
use crate::dataset::ZoneSnapshot;

/// Envelope format written by this version
const SNAPSHOT_FORMAT: u32 = 1;

#[derive(Serialize, Deserialize)]
struct SnapshotEnvelope<S> {
    format: u32,
    written_by: Uuid,
    written_at: DateTime<Utc>,
    snapshot: S,
}

/// A snapshot read back from the store
#[derive(Clone, Debug)]
pub struct StoredSnapshot {
    /// The restored snapshot (already validated)
    pub snapshot: ZoneSnapshot,
    /// Instance that wrote it
    pub written_by: Uuid,
    /// When it was written
    pub written_at: DateTime<Utc>,
}

/// Best-effort snapshot persistence over a [`SharedStore`]
#[derive(Clone, Debug)]
pub struct DistributedCacheStore {
    store: SharedStore,
    key: String,
    ttl: Duration,
    instance_id: Uuid,
    clock: SharedClock,
}

impl DistributedCacheStore {
    /// Create a snapshot store under `{prefix}:snapshot`
    #[must_use]
    pub fn new(store: SharedStore, prefix: &str, ttl: Duration, clock: SharedClock) -> Self {
        Self {
            store,
            key: format!("{prefix}:snapshot"),
            ttl,
            instance_id: Uuid::new_v4(),
            clock,
        }
    }

    /// Identifier written into snapshots saved by this instance
    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Storage key
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether a store is configured
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.store.is_enabled()
    }

    /// Live connection state of the underlying store
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.store.is_connected()
    }

    /// Persist `snapshot`, returning whether it was written
    pub async fn save(&self, snapshot: &ZoneSnapshot) -> bool {
        if !self.store.is_enabled() {
            return false;
        }

        let envelope = SnapshotEnvelope {
            format: SNAPSHOT_FORMAT,
            written_by: self.instance_id,
            written_at: self.clock.now(),
            snapshot,
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize cache snapshot");
                return false;
            }
        };

        match self.store.set_ex(&self.key, &payload, self.ttl).await {
            Ok(()) => {
                tracing::debug!(
                    key = %self.key,
                    bytes = payload.len(),
                    version = %snapshot.metadata().version,
                    "Saved cache snapshot to shared store"
                );
                true
            }
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Failed to save cache snapshot");
                false
            }
        }
    }

    /// Load and validate the stored snapshot, if any
    pub async fn load(&self) -> Option<StoredSnapshot> {
        if !self.store.is_enabled() {
            return None;
        }

        let payload = match self.store.get(&self.key).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Failed to load cache snapshot");
                return None;
            }
        };

        let envelope: SnapshotEnvelope<ZoneSnapshot> = match serde_json::from_str(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Discarding unreadable cache snapshot");
                return None;
            }
        };

        if envelope.format != SNAPSHOT_FORMAT {
            tracing::info!(
                format = envelope.format,
                expected = SNAPSHOT_FORMAT,
                "Ignoring cache snapshot with a different format"
            );
            return None;
        }

        if let Err(e) = envelope.snapshot.validate() {
            tracing::warn!(key = %self.key, error = %e, "Discarding inconsistent cache snapshot");
            return None;
        }

        Some(StoredSnapshot {
            snapshot: envelope.snapshot,
            written_by: envelope.written_by,
            written_at: envelope.written_at,
        })
    }

    /// Remove the stored snapshot, returning whether the store accepted it
    pub async fn clear(&self) -> bool {
        if !self.store.is_enabled() {
            return false;
        }
        match self.store.del(&self.key).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Failed to clear cache snapshot");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::dataset::Dataset;
    use crate::spatial::{parse_feature_collection, Coordinates};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    const DOC: &str = r#"{"type": "FeatureCollection", "features": [
        {"type": "Feature", "properties": {"GEOID": "Z1"},
         "geometry": {"type": "Polygon", "coordinates": [[[0,0],[0,10],[10,10],[10,0],[0,0]]]}}
    ]}"#;

    fn snapshot(clock: &ManualClock) -> ZoneSnapshot {
        let features = parse_feature_collection(DOC.as_bytes(), "GEOID").unwrap();
        ZoneSnapshot::build(Dataset::new(features, clock.now(), Duration::from_secs(60)).unwrap())
            .unwrap()
    }

    fn setup() -> (DistributedCacheStore, MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let memory = MemoryStore::new(clock.clone());
        let store = DistributedCacheStore::new(
            SharedStore::Memory(memory.clone()),
            "oz",
            Duration::from_secs(60),
            clock.clone(),
        );
        (store, memory, clock)
    }

    #[tokio::test]
    async fn test_save_load_clear() {
        let (store, _, clock) = setup();
        let snap = snapshot(&clock);

        assert!(store.load().await.is_none());
        assert!(store.save(&snap).await);

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.written_by, store.instance_id());
        assert_eq!(loaded.snapshot.metadata(), snap.metadata());
        assert!(loaded.snapshot.query(Coordinates::new(5.0, 5.0).unwrap()).in_zone);

        assert!(store.clear().await);
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_expires_with_ttl() {
        let (store, _, clock) = setup();
        assert!(store.save(&snapshot(&clock)).await);

        clock.advance(Duration::from_secs(61));
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn test_disconnected_store_is_best_effort() {
        let (store, memory, clock) = setup();
        memory.set_connected(false);

        assert!(!store.is_connected());
        assert!(!store.save(&snapshot(&clock)).await);
        assert!(store.load().await.is_none());
        assert!(!store.clear().await);
    }

    #[tokio::test]
    async fn test_corrupt_payload_ignored() {
        let (store, memory, _) = setup();
        memory
            .set_ex(store.key(), "{not json", Duration::from_secs(60))
            .unwrap();
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_store() {
        let clock = Arc::new(ManualClock::at_unix(0));
        let store = DistributedCacheStore::new(
            SharedStore::Disabled,
            "oz",
            Duration::from_secs(60),
            clock.clone(),
        );
        assert!(!store.is_enabled());
        assert!(!store.save(&snapshot(&clock)).await);
        assert!(store.load().await.is_none());
    }
}
