//! Packed R-tree over feature bounding boxes
//!
//! The index is bulk-loaded once per dataset with Sort-Tile-Recursive packing
//! and never mutated afterwards. A refresh builds a new index from scratch.
//!
//! ```text
//!   levels[2]        [root]
//!                   /      \
//!   levels[1]   [n0 .. n15] [n16 .. ]
//!                 |
//!   levels[0]   [leaf nodes, each covering <= 16 entries]
//!                 |
//!   entries     [(bbox, feature position), ...]
//! ```
//!
//! # Query
//!
//! A lookup narrows candidates to entries whose box overlaps a window of
//! [`QUERY_MARGIN_DEGREES`] around the point, then tests exact containment on
//! each candidate in feature insertion order. The first containing feature
//! wins, so overlapping polygons resolve to the one listed first in the
//! source document.
//!
//! # Boundary Policy
//!
//! Containment is boundary-inclusive: a point lying exactly on an edge or a
//! vertex of a feature's boundary (including a hole's boundary) is reported
//! as inside that feature.

use geo::algorithm::coordinate_position::{CoordPos, CoordinatePosition};
use geo::{Coord, Rect};
use serde::{Deserialize, Serialize};

use super::feature::Feature;
use crate::error::{ZoneError, ZoneResult};

/// Half-width of the candidate search window, in degrees
pub const QUERY_MARGIN_DEGREES: f64 = 0.1;

/// Maximum children per node
pub const NODE_CAPACITY: usize = 16;

/// Leaf entry: one feature's bounding box and its position in the dataset
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
struct IndexEntry {
    bbox: Rect<f64>,
    position: usize,
}

/// Internal node: bounding box over a contiguous child range one level down
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
struct IndexNode {
    bbox: Rect<f64>,
    start: usize,
    end: usize,
}

/// Bulk-loaded spatial index over a dataset's features
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpatialIndex {
    entries: Vec<IndexEntry>,
    /// `levels[0]` groups entries; `levels[k]` groups `levels[k - 1]`.
    /// The last level holds exactly one root node.
    levels: Vec<Vec<IndexNode>>,
}

impl SpatialIndex {
    /// Bulk-load an index over `features`
    ///
    /// # Errors
    ///
    /// Returns `IndexBuild` if there are no features or any bounding box is
    /// not finite.
    pub fn build(features: &[Feature]) -> ZoneResult<Self> {
        if features.is_empty() {
            return Err(ZoneError::IndexBuild(
                "cannot index an empty feature set".to_string(),
            ));
        }

        let mut entries = Vec::with_capacity(features.len());
        for (position, feature) in features.iter().enumerate() {
            if !rect_is_finite(&feature.bbox) {
                return Err(ZoneError::IndexBuild(format!(
                    "feature {} has a non-finite bounding box",
                    feature.id
                )));
            }
            entries.push(IndexEntry {
                bbox: feature.bbox,
                position,
            });
        }

        str_sort(&mut entries, |e| e.bbox);
        let mut levels = Vec::new();
        let mut level = pack(&entries.iter().map(|e| e.bbox).collect::<Vec<_>>());

        while level.len() > 1 {
            str_sort(&mut level, |n| n.bbox);
            let parents = pack(&level.iter().map(|n| n.bbox).collect::<Vec<_>>());
            levels.push(level);
            level = parents;
        }
        levels.push(level);

        Ok(Self { entries, levels })
    }

    /// Number of indexed features
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty (never true for a built index)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tree height including the leaf level
    #[must_use]
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Check that this index was built from `features`
    ///
    /// Used before adopting an index restored from the shared store.
    ///
    /// # Errors
    ///
    /// Returns `IndexBuild` describing the first inconsistency found.
    pub fn validate_for(&self, features: &[Feature]) -> ZoneResult<()> {
        if self.entries.len() != features.len() {
            return Err(ZoneError::IndexBuild(format!(
                "index has {} entries for {} features",
                self.entries.len(),
                features.len()
            )));
        }
        let mut seen = vec![false; features.len()];
        for entry in &self.entries {
            let feature = features.get(entry.position).ok_or_else(|| {
                ZoneError::IndexBuild(format!("entry position {} out of range", entry.position))
            })?;
            if seen[entry.position] || feature.bbox != entry.bbox {
                return Err(ZoneError::IndexBuild(format!(
                    "entry for feature {} does not match the dataset",
                    feature.id
                )));
            }
            seen[entry.position] = true;
        }
        for (k, level) in self.levels.iter().enumerate() {
            let child_len = if k == 0 {
                self.entries.len()
            } else {
                self.levels[k - 1].len()
            };
            if level.iter().any(|n| n.start > n.end || n.end > child_len) {
                return Err(ZoneError::IndexBuild(format!(
                    "level {k} has a node range outside its children"
                )));
            }
        }
        match self.levels.last() {
            Some(root) if root.len() == 1 => Ok(()),
            _ => Err(ZoneError::IndexBuild("index has no root node".to_string())),
        }
    }

    /// Feature positions whose bounding box overlaps `window`, ascending
    #[must_use]
    pub fn candidates(&self, window: &Rect<f64>) -> Vec<usize> {
        let mut found = Vec::new();
        let Some(top) = self.levels.len().checked_sub(1) else {
            return found;
        };

        let mut stack: Vec<(usize, usize, usize)> = vec![(top, 0, self.levels[top].len())];
        while let Some((level, start, end)) = stack.pop() {
            for node in &self.levels[level][start..end] {
                if !overlaps(&node.bbox, window) {
                    continue;
                }
                if level == 0 {
                    found.extend(
                        self.entries[node.start..node.end]
                            .iter()
                            .filter(|e| overlaps(&e.bbox, window))
                            .map(|e| e.position),
                    );
                } else {
                    stack.push((level - 1, node.start, node.end));
                }
            }
        }

        found.sort_unstable();
        found
    }

    /// Position of the first feature containing `point` (boundary-inclusive)
    ///
    /// `point` is `x = longitude, y = latitude`. `features` must be the slice
    /// this index was built from.
    #[must_use]
    pub fn query(&self, features: &[Feature], point: Coord<f64>) -> Option<usize> {
        let window = Rect::new(
            Coord {
                x: point.x - QUERY_MARGIN_DEGREES,
                y: point.y - QUERY_MARGIN_DEGREES,
            },
            Coord {
                x: point.x + QUERY_MARGIN_DEGREES,
                y: point.y + QUERY_MARGIN_DEGREES,
            },
        );

        let candidates = self.candidates(&window);
        tracing::trace!(
            candidates = candidates.len(),
            "Checking point against nearby features"
        );

        candidates.into_iter().find(|&position| {
            features
                .get(position)
                .is_some_and(|feature| contains_inclusive(feature, point))
        })
    }
}

/// Boundary-inclusive containment against every member polygon
#[must_use]
pub fn contains_inclusive(feature: &Feature, point: Coord<f64>) -> bool {
    feature
        .geometry
        .0
        .iter()
        .any(|polygon| polygon.coordinate_position(&point) != CoordPos::Outside)
}

// =============================================================================
// Packing helpers
// =============================================================================

/// Reorder items into Sort-Tile-Recursive order
fn str_sort<T>(items: &mut [T], bbox: impl Fn(&T) -> Rect<f64>) {
    let leaf_count = items.len().div_ceil(NODE_CAPACITY);
    // ceil(sqrt(leaf_count)) vertical slices
    let slices = (leaf_count as f64).sqrt().ceil().max(1.0) as usize;
    let slice_len = slices * NODE_CAPACITY;

    items.sort_by(|a, b| center(&bbox(a)).x.total_cmp(&center(&bbox(b)).x));
    for slice in items.chunks_mut(slice_len) {
        slice.sort_by(|a, b| center(&bbox(a)).y.total_cmp(&center(&bbox(b)).y));
    }
}

/// Group consecutive boxes into parent nodes of up to `NODE_CAPACITY`
fn pack(boxes: &[Rect<f64>]) -> Vec<IndexNode> {
    boxes
        .chunks(NODE_CAPACITY)
        .enumerate()
        .map(|(i, chunk)| {
            let start = i * NODE_CAPACITY;
            IndexNode {
                bbox: union_all(chunk),
                start,
                end: start + chunk.len(),
            }
        })
        .collect()
}

fn union_all(boxes: &[Rect<f64>]) -> Rect<f64> {
    let mut min = Coord {
        x: f64::INFINITY,
        y: f64::INFINITY,
    };
    let mut max = Coord {
        x: f64::NEG_INFINITY,
        y: f64::NEG_INFINITY,
    };
    for b in boxes {
        min.x = min.x.min(b.min().x);
        min.y = min.y.min(b.min().y);
        max.x = max.x.max(b.max().x);
        max.y = max.y.max(b.max().y);
    }
    Rect::new(min, max)
}

fn center(rect: &Rect<f64>) -> Coord<f64> {
    Coord {
        x: (rect.min().x + rect.max().x) / 2.0,
        y: (rect.min().y + rect.max().y) / 2.0,
    }
}

fn overlaps(a: &Rect<f64>, b: &Rect<f64>) -> bool {
    a.min().x <= b.max().x && b.min().x <= a.max().x && a.min().y <= b.max().y && b.min().y <= a.max().y
}

fn rect_is_finite(rect: &Rect<f64>) -> bool {
    [rect.min().x, rect.min().y, rect.max().x, rect.max().y]
        .iter()
        .all(|v| v.is_finite())
}
