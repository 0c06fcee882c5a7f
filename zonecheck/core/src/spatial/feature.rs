//! GeoJSON FeatureCollection parsing
//!
//! Zone documents arrive as GeoJSON. Only the geometry and one identifying
//! property survive parsing; every other property is dropped here so the
//! in-memory dataset stays small.
//!
//! Accepted shapes:
//!
//! - `Polygon` (normalised to a single-member `MultiPolygon`)
//! - `MultiPolygon`
//!
//! Anything else, a missing geometry, or an empty feature list is a
//! [`ZoneError::MalformedDataset`].

use std::collections::HashMap;

use geo::{BoundingRect, Coord, LineString, MultiPolygon, Polygon, Rect};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ZoneError, ZoneResult};

/// Default property holding the zone identifier
pub const DEFAULT_ID_PROPERTY: &str = "GEOID";

// =============================================================================
// Feature
// =============================================================================

/// One zone boundary with a stable identifier
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    /// Zone identifier
    pub id: String,

    /// Boundary geometry (lon/lat degrees)
    pub geometry: MultiPolygon<f64>,

    /// Bounding box of the exterior rings
    pub bbox: Rect<f64>,
}

impl Feature {
    /// Build a feature from a geometry, computing its bounding box
    ///
    /// # Errors
    ///
    /// Returns `MalformedDataset` if the geometry has no coordinates.
    pub fn new(id: impl Into<String>, geometry: MultiPolygon<f64>) -> ZoneResult<Self> {
        let id = id.into();
        let bbox = geometry.bounding_rect().ok_or_else(|| {
            ZoneError::MalformedDataset(format!("feature {id} has an empty geometry"))
        })?;
        Ok(Self { id, geometry, bbox })
    }
}

// =============================================================================
// Raw GeoJSON
// =============================================================================

#[derive(Deserialize)]
struct RawCollection {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    features: Option<Vec<RawFeature>>,
}

#[derive(Deserialize)]
struct RawFeature {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    bbox: Option<Vec<f64>>,
    #[serde(default)]
    geometry: Option<RawGeometry>,
    #[serde(default)]
    properties: Option<HashMap<String, Value>>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum RawGeometry {
    Polygon {
        coordinates: Vec<Vec<Vec<f64>>>,
    },
    MultiPolygon {
        coordinates: Vec<Vec<Vec<Vec<f64>>>>,
    },
    #[serde(other)]
    Unsupported,
}

// =============================================================================
// Parsing
// =============================================================================

/// Parse a GeoJSON FeatureCollection into stripped features
///
/// `id_property` names the property carrying the zone identifier. When it is
/// absent the GeoJSON `id` member is used, then `feature-{index}`.
///
/// # Errors
///
/// Returns `MalformedDataset` when the document is not valid JSON, is not a
/// FeatureCollection, has no features, or any feature has a missing or
/// unsupported geometry.
pub fn parse_feature_collection(bytes: &[u8], id_property: &str) -> ZoneResult<Vec<Feature>> {
    let raw: RawCollection = serde_json::from_slice(bytes)
        .map_err(|e| ZoneError::MalformedDataset(format!("invalid GeoJSON: {e}")))?;

    if let Some(kind) = raw.kind.as_deref() {
        if kind != "FeatureCollection" {
            return Err(ZoneError::MalformedDataset(format!(
                "expected FeatureCollection, got {kind}"
            )));
        }
    }

    let raw_features = raw.features.unwrap_or_default();
    if raw_features.is_empty() {
        return Err(ZoneError::MalformedDataset(
            "missing features array".to_string(),
        ));
    }

    raw_features
        .into_iter()
        .enumerate()
        .map(|(index, raw)| convert_feature(index, raw, id_property))
        .collect()
}

fn convert_feature(index: usize, raw: RawFeature, id_property: &str) -> ZoneResult<Feature> {
    let id = raw
        .properties
        .as_ref()
        .and_then(|props| props.get(id_property))
        .and_then(value_to_id)
        .or_else(|| raw.id.as_ref().and_then(value_to_id))
        .unwrap_or_else(|| format!("feature-{index}"));

    let geometry = match raw.geometry {
        None => {
            return Err(ZoneError::MalformedDataset(format!(
                "feature {index} ({id}) has no geometry"
            )))
        }
        Some(RawGeometry::Unsupported) => {
            return Err(ZoneError::MalformedDataset(format!(
                "feature {index} ({id}) is not a Polygon or MultiPolygon"
            )))
        }
        Some(RawGeometry::Polygon { coordinates }) => {
            MultiPolygon::new(vec![convert_polygon(index, &coordinates)?])
        }
        Some(RawGeometry::MultiPolygon { coordinates }) => MultiPolygon::new(
            coordinates
                .iter()
                .map(|polygon| convert_polygon(index, polygon))
                .collect::<ZoneResult<Vec<_>>>()?,
        ),
    };

    if geometry.0.is_empty() {
        return Err(ZoneError::MalformedDataset(format!(
            "feature {index} ({id}) has an empty MultiPolygon"
        )));
    }

    match raw.bbox.as_deref().and_then(declared_bbox) {
        Some(bbox) => Ok(Feature { id, geometry, bbox }),
        None => Feature::new(id, geometry),
    }
}

fn convert_polygon(index: usize, rings: &[Vec<Vec<f64>>]) -> ZoneResult<Polygon<f64>> {
    let mut rings = rings.iter().map(|ring| convert_ring(index, ring));
    let exterior = rings.next().ok_or_else(|| {
        ZoneError::MalformedDataset(format!("feature {index} has a polygon with no rings"))
    })??;
    let interiors = rings.collect::<ZoneResult<Vec<_>>>()?;
    Ok(Polygon::new(exterior, interiors))
}

fn convert_ring(index: usize, ring: &[Vec<f64>]) -> ZoneResult<LineString<f64>> {
    if ring.len() < 3 {
        return Err(ZoneError::MalformedDataset(format!(
            "feature {index} has a ring with {} positions",
            ring.len()
        )));
    }
    ring.iter()
        .map(|position| match position.as_slice() {
            [x, y, ..] if x.is_finite() && y.is_finite() => Ok(Coord { x: *x, y: *y }),
            _ => Err(ZoneError::MalformedDataset(format!(
                "feature {index} has an invalid position {position:?}"
            ))),
        })
        .collect::<ZoneResult<Vec<_>>>()
        .map(LineString::new)
}

/// Accept a 2D or 3D GeoJSON `bbox` member if it is well-formed
fn declared_bbox(values: &[f64]) -> Option<Rect<f64>> {
    let (min_x, min_y, max_x, max_y) = match *values {
        [min_x, min_y, max_x, max_y] => (min_x, min_y, max_x, max_y),
        [min_x, min_y, _, max_x, max_y, _] => (min_x, min_y, max_x, max_y),
        _ => return None,
    };
    let finite = [min_x, min_y, max_x, max_y].iter().all(|v| v.is_finite());
    (finite && min_x <= max_x && min_y <= max_y).then(|| {
        Rect::new(
            Coord { x: min_x, y: min_y },
            Coord { x: max_x, y: max_y },
        )
    })
}

fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
