//! Validated geographic coordinates

use geo::Coord;
use serde::{Deserialize, Serialize};

use crate::error::{ZoneError, ZoneResult};

/// A latitude/longitude pair in decimal degrees
///
/// Construct through [`Coordinates::new`], which rejects out-of-range and
/// non-finite values.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    /// Latitude in `[-90, 90]`
    pub latitude: f64,
    /// Longitude in `[-180, 180]`
    pub longitude: f64,
}

impl Coordinates {
    /// Validate and build coordinates
    ///
    /// # Errors
    ///
    /// Returns `Validation` if either value is non-finite or out of range.
    pub fn new(latitude: f64, longitude: f64) -> ZoneResult<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(ZoneError::Validation(format!(
                "latitude {latitude} must be between -90 and 90"
            )));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(ZoneError::Validation(format!(
                "longitude {longitude} must be between -180 and 180"
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// GeoJSON axis order: `x = longitude`, `y = latitude`
    #[must_use]
    pub fn to_coord(self) -> Coord<f64> {
        Coord {
            x: self.longitude,
            y: self.latitude,
        }
    }
}

impl std::fmt::Display for Coordinates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.6}, {:.6})", self.latitude, self.longitude)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_coordinates() {
        let c = Coordinates::new(34.05, -118.25).unwrap();
        assert_eq!(c.to_coord(), Coord { x: -118.25, y: 34.05 });
        assert!(Coordinates::new(90.0, 180.0).is_ok());
        assert!(Coordinates::new(-90.0, -180.0).is_ok());
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(matches!(
            Coordinates::new(90.5, 0.0),
            Err(ZoneError::Validation(_))
        ));
        assert!(matches!(
            Coordinates::new(0.0, -180.1),
            Err(ZoneError::Validation(_))
        ));
        assert!(Coordinates::new(f64::NAN, 0.0).is_err());
        assert!(Coordinates::new(0.0, f64::INFINITY).is_err());
    }
}
