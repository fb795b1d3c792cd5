// Geodesy module - local-frame projection and distance calculations
//
// Provides conversions between:
// - Geographic coordinates (latitude/longitude in degrees)
// - The local 3D frame (metres) whose origin is a configurable reference point
//
// The projection is a flat-earth approximation with fixed per-degree scales,
// adequate over the few hundred metres a tracked site spans.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use thiserror::Error;

use crate::constants::{
    DEFAULT_REFERENCE_LAT, DEFAULT_REFERENCE_LON, EARTH_RADIUS_M, LAT_TO_Z, LON_TO_X,
};
use crate::record::Position3D;

/// Degrees to radians conversion factor
const DTOR: f64 = PI / 180.0;

/// Geographic coordinate treated as the local origin (0, 0, 0)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferencePoint {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ReferenceError {
    #[error("latitude {0} outside [-90, 90]")]
    Latitude(f64),
    #[error("longitude {0} outside [-180, 180]")]
    Longitude(f64),
}

impl ReferencePoint {
    /// Build a validated reference point
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, ReferenceError> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(ReferenceError::Latitude(latitude));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(ReferenceError::Longitude(longitude));
        }
        Ok(Self { latitude, longitude })
    }
}

impl Default for ReferencePoint {
    fn default() -> Self {
        Self {
            latitude: DEFAULT_REFERENCE_LAT,
            longitude: DEFAULT_REFERENCE_LON,
        }
    }
}

/// Projects a GPS fix into the local frame of `reference`
///
/// X grows eastward, Z grows southward (increasing latitude gives decreasing Z),
/// Y is always 0.
pub fn to_local(reference: &ReferencePoint, latitude: f64, longitude: f64) -> Position3D {
    let lat_diff = latitude - reference.latitude;
    let lon_diff = longitude - reference.longitude;

    Position3D {
        x: lon_diff * LON_TO_X,
        y: 0.0,
        z: lat_diff * LAT_TO_Z,
    }
}

/// Inverse of [`to_local`]; Y is ignored
pub fn to_geographic(reference: &ReferencePoint, position: &Position3D) -> (f64, f64) {
    let latitude = reference.latitude + position.z / LAT_TO_Z;
    let longitude = reference.longitude + position.x / LON_TO_X;
    (latitude, longitude)
}

/// Great-circle distance between two lat/lon points in metres (haversine, spherical earth)
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1 * DTOR;
    let phi2 = lat2 * DTOR;
    let d_phi = (lat2 - lat1) * DTOR;
    let d_lambda = (lon2 - lon1) * DTOR;

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_maps_to_origin() {
        let reference = ReferencePoint::default();
        let p = to_local(&reference, reference.latitude, reference.longitude);
        assert_eq!(p, Position3D::default());
    }

    #[test]
    fn test_north_is_negative_z() {
        let reference = ReferencePoint::default();
        let p = to_local(&reference, 37.563608, 127.079571);
        assert!((p.z - (-10.101)).abs() < 1e-2, "z = {}", p.z);
        assert!(p.x.abs() < 1e-9);
        assert_eq!(p.y, 0.0);
    }

    #[test]
    fn test_east_is_positive_x() {
        let reference = ReferencePoint::default();
        let p = to_local(&reference, reference.latitude, reference.longitude + 0.0001);
        assert!((p.x - 8.88).abs() < 1e-6);
    }

    #[test]
    fn test_inverse_projection() {
        let reference = ReferencePoint::new(37.5, 127.0).unwrap();
        let p = to_local(&reference, 37.5012, 127.0034);
        let (lat, lon) = to_geographic(&reference, &p);
        assert!((lat - 37.5012).abs() < 1e-9);
        assert!((lon - 127.0034).abs() < 1e-9);
    }

    #[test]
    fn test_haversine_one_degree_latitude() {
        let d = haversine_distance(37.0, 127.0, 38.0, 127.0);
        // 1 degree of arc on a 6371 km sphere
        assert!((d - 111_194.9).abs() < 1.0, "d = {}", d);
        assert_eq!(haversine_distance(37.0, 127.0, 37.0, 127.0), 0.0);
    }

    #[test]
    fn test_reference_validation() {
        assert!(ReferencePoint::new(37.5, 127.0).is_ok());
        assert_eq!(ReferencePoint::new(91.0, 0.0), Err(ReferenceError::Latitude(91.0)));
        assert_eq!(ReferencePoint::new(0.0, -181.0), Err(ReferenceError::Longitude(-181.0)));
        assert!(ReferencePoint::new(f64::NAN, 0.0).is_err());
    }
}
