//! Versioned zone datasets and installed snapshots
//!
//! A [`Dataset`] is an immutable, ordered feature list plus metadata. A
//! [`ZoneSnapshot`] pairs a dataset with the [`SpatialIndex`] built from it;
//! the snapshot is what the cache swaps in atomically and what peers share
//! through the distributed store.
//!
//! # Versioning
//!
//! The content hash is SHA-256 over the canonical JSON of the stripped
//! features, so it only changes when geometry or identifiers change. The
//! version string is derived from the hash (`v1-<first 12 hex chars>`) and is
//! therefore identical across refreshes of an unchanged document.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::clock::to_chrono;
use crate::error::{ZoneError, ZoneResult};
use crate::spatial::{Coordinates, Feature, SpatialIndex};

/// Length of the hash prefix embedded in the version string
const VERSION_HASH_CHARS: usize = 12;

// =============================================================================
// Dataset
// =============================================================================

/// Metadata describing one dataset generation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    /// Content-derived version string
    pub version: String,
    /// Lowercase hex SHA-256 of the canonical feature list
    pub content_hash: String,
    /// Number of features
    pub feature_count: usize,
    /// When this generation was loaded or last confirmed unchanged
    pub loaded_at: DateTime<Utc>,
    /// `loaded_at + ttl`
    pub next_refresh_at: DateTime<Utc>,
}

/// Immutable feature collection with metadata
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    features: Arc<Vec<Feature>>,
    metadata: DatasetMetadata,
}

impl Dataset {
    /// Build a dataset, hashing its features
    ///
    /// # Errors
    ///
    /// Returns `MalformedDataset` if `features` is empty.
    pub fn new(features: Vec<Feature>, loaded_at: DateTime<Utc>, ttl: Duration) -> ZoneResult<Self> {
        if features.is_empty() {
            return Err(ZoneError::MalformedDataset(
                "dataset has no features".to_string(),
            ));
        }
        let content_hash = content_hash(&features)?;
        Ok(Self {
            metadata: DatasetMetadata {
                version: version_for(&content_hash),
                feature_count: features.len(),
                content_hash,
                loaded_at,
                next_refresh_at: loaded_at + to_chrono(ttl),
            },
            features: Arc::new(features),
        })
    }

    /// Same content with new timestamps
    #[must_use]
    pub fn renewed(&self, loaded_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            features: Arc::clone(&self.features),
            metadata: DatasetMetadata {
                loaded_at,
                next_refresh_at: loaded_at + to_chrono(ttl),
                ..self.metadata.clone()
            },
        }
    }

    /// Features in insertion order
    #[must_use]
    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    /// Dataset metadata
    #[must_use]
    pub fn metadata(&self) -> &DatasetMetadata {
        &self.metadata
    }

    /// Whether the dataset is past its refresh time
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now >= self.metadata.next_refresh_at
    }

    /// Whether the metadata is internally consistent
    fn check_metadata(&self) -> ZoneResult<()> {
        if self.metadata.feature_count != self.features.len() {
            return Err(ZoneError::IndexBuild(format!(
                "metadata claims {} features, dataset has {}",
                self.metadata.feature_count,
                self.features.len()
            )));
        }
        let recomputed = content_hash(&self.features)?;
        if recomputed != self.metadata.content_hash {
            return Err(ZoneError::IndexBuild(
                "content hash does not match features".to_string(),
            ));
        }
        Ok(())
    }
}

/// SHA-256 over the canonical JSON encoding of `features`
///
/// # Errors
///
/// Returns `IndexBuild` if the features cannot be serialized.
pub fn content_hash(features: &[Feature]) -> ZoneResult<String> {
    let canonical = serde_json::to_vec(features)
        .map_err(|e| ZoneError::IndexBuild(format!("failed to serialize features: {e}")))?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(hex::encode(hasher.finalize()))
}

/// Version string for a content hash
#[must_use]
pub fn version_for(content_hash: &str) -> String {
    let prefix = content_hash.get(..VERSION_HASH_CHARS).unwrap_or(content_hash);
    format!("v1-{prefix}")
}

// =============================================================================
// Snapshot
// =============================================================================

/// Result of a containment lookup
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneMatch {
    /// Whether the point is inside any zone
    pub in_zone: bool,
    /// Identifier of the first containing zone
    pub zone_id: Option<String>,
}

/// A dataset together with the index built from it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZoneSnapshot {
    dataset: Dataset,
    index: Arc<SpatialIndex>,
}

impl ZoneSnapshot {
    /// Build the index for `dataset`
    ///
    /// # Errors
    ///
    /// Returns `IndexBuild` if construction fails.
    pub fn build(dataset: Dataset) -> ZoneResult<Self> {
        let index = SpatialIndex::build(dataset.features())?;
        Ok(Self {
            dataset,
            index: Arc::new(index),
        })
    }

    /// Reuse this snapshot's index for a dataset with identical content
    ///
    /// # Errors
    ///
    /// Returns `IndexBuild` if `dataset` has a different content hash.
    pub fn with_dataset(&self, dataset: Dataset) -> ZoneResult<Self> {
        if dataset.metadata.content_hash != self.dataset.metadata.content_hash {
            return Err(ZoneError::IndexBuild(
                "cannot reuse index for different content".to_string(),
            ));
        }
        Ok(Self {
            dataset,
            index: Arc::clone(&self.index),
        })
    }

    /// Check that a restored snapshot is internally consistent
    ///
    /// # Errors
    ///
    /// Returns `IndexBuild` naming the inconsistency.
    pub fn validate(&self) -> ZoneResult<()> {
        self.dataset.check_metadata()?;
        self.index.validate_for(self.dataset.features())
    }

    /// The dataset
    #[must_use]
    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Shorthand for the dataset's metadata
    #[must_use]
    pub fn metadata(&self) -> &DatasetMetadata {
        &self.dataset.metadata
    }

    /// Whether the index is shared with `other` (no rebuild happened)
    #[must_use]
    pub fn shares_index_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.index, &other.index)
    }

    /// Look up the zone containing `coords`
    #[must_use]
    pub fn query(&self, coords: Coordinates) -> ZoneMatch {
        let features = self.dataset.features();
        match self.index.query(features, coords.to_coord()) {
            Some(position) => ZoneMatch {
                in_zone: true,
                zone_id: features.get(position).map(|f| f.id.clone()),
            },
            None => ZoneMatch {
                in_zone: false,
                zone_id: None,
            },
        }
    }
}
