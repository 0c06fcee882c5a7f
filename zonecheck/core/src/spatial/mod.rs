//! Zone geometry: coordinates, GeoJSON parsing and the containment index

pub mod coordinates;
pub mod feature;
pub mod index;

pub use coordinates::Coordinates;
pub use feature::{parse_feature_collection, Feature, DEFAULT_ID_PROPERTY};
pub use index::{contains_inclusive, SpatialIndex, NODE_CAPACITY, QUERY_MARGIN_DEGREES};
