//! Spherical geometry utilities
//!
//! Pure functions over WGS-ish spherical coordinates: initial bearing,
//! Haversine distance, angle normalization, 8-way compass bucketing and
//! direct-geodesic projection. Everything here is deterministic and
//! side-effect free; callers pass and receive degrees, trig runs in
//! radians internally.
//!
//! The same sphere radius is used for distance and projection so that
//! dead-reckoning (`crate::predict`) round-trips: projecting by the
//! distance between two points along their bearing lands on the second
//! point (within floating-point noise).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Mean Earth radius in meters (spherical model).
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A geographic coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees, positive north.
    pub latitude: f64,
    /// Longitude in degrees, positive east.
    pub longitude: f64,
}

impl GeoPoint {
    /// Create a point from latitude/longitude in degrees.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// True when both axes are within `tolerance` degrees of `other`.
    pub fn approx_eq(&self, other: &GeoPoint, tolerance: f64) -> bool {
        (self.latitude - other.latitude).abs() <= tolerance
            && (self.longitude - other.longitude).abs() <= tolerance
    }
}

impl fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.latitude, self.longitude)
    }
}

/// The 8 principal compass directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompassDirection {
    /// North
    North,
    /// North-east
    NorthEast,
    /// East
    East,
    /// South-east
    SouthEast,
    /// South
    South,
    /// South-west
    SouthWest,
    /// West
    West,
    /// North-west
    NorthWest,
}

impl CompassDirection {
    /// Short label ("N", "NE", ...).
    pub fn label(&self) -> &'static str {
        match self {
            Self::North => "N",
            Self::NorthEast => "NE",
            Self::East => "E",
            Self::SouthEast => "SE",
            Self::South => "S",
            Self::SouthWest => "SW",
            Self::West => "W",
            Self::NorthWest => "NW",
        }
    }
}

impl fmt::Display for CompassDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Normalize any degree value into `[0, 360)`.
pub fn normalize_angle(degrees: f64) -> f64 {
    let wrapped = degrees % 360.0;
    if wrapped < 0.0 {
        wrapped + 360.0
    } else {
        wrapped
    }
}

/// Initial bearing from `from` toward `to` along the great circle, in
/// degrees normalized to `[0, 360)`.
///
/// Numerically identical points would make the atan2 arguments collapse
/// to (0, 0); that degenerate case returns bearing 0 instead of NaN.
pub fn bearing(from: &GeoPoint, to: &GeoPoint) -> f64 {
    let lat1 = from.latitude.to_radians();
    let lat2 = to.latitude.to_radians();
    let delta_lon = (to.longitude - from.longitude).to_radians();

    let y = delta_lon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * delta_lon.cos();

    if y == 0.0 && x == 0.0 {
        return 0.0;
    }

    normalize_angle(y.atan2(x).to_degrees())
}

/// Great-circle distance between two points in meters (Haversine).
pub fn distance(from: &GeoPoint, to: &GeoPoint) -> f64 {
    let lat1 = from.latitude.to_radians();
    let lat2 = to.latitude.to_radians();
    let delta_lat = (to.latitude - from.latitude).to_radians();
    let delta_lon = (to.longitude - from.longitude).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Project `from` forward by `distance_m` meters along `bearing_deg`
/// using the spherical direct-geodesic formula.
pub fn destination(from: &GeoPoint, bearing_deg: f64, distance_m: f64) -> GeoPoint {
    let angular = distance_m / EARTH_RADIUS_M;
    let theta = bearing_deg.to_radians();
    let lat1 = from.latitude.to_radians();
    let lon1 = from.longitude.to_radians();

    let lat2 =
        (lat1.sin() * angular.cos() + lat1.cos() * angular.sin() * theta.cos()).asin();
    let lon2 = lon1
        + (theta.sin() * angular.sin() * lat1.cos())
            .atan2(angular.cos() - lat1.sin() * lat2.sin());

    GeoPoint::new(lat2.to_degrees(), normalize_longitude(lon2.to_degrees()))
}

/// Map a bearing onto one of the 8 compass directions.
///
/// Sectors are 45° wide and centered on the principal directions, so the
/// boundaries fall at 22.5°, 67.5°, ... Boundary values belong to the
/// sector they open (22.5 is NorthEast).
pub fn direction(bearing_deg: f64) -> CompassDirection {
    let b = normalize_angle(bearing_deg);
    // Shift by half a sector so each direction owns [center-22.5, center+22.5).
    let sector = ((b + 22.5) / 45.0).floor() as usize % 8;
    match sector {
        0 => CompassDirection::North,
        1 => CompassDirection::NorthEast,
        2 => CompassDirection::East,
        3 => CompassDirection::SouthEast,
        4 => CompassDirection::South,
        5 => CompassDirection::SouthWest,
        6 => CompassDirection::West,
        _ => CompassDirection::NorthWest,
    }
}

/// Wrap a longitude into `[-180, 180)`.
fn normalize_longitude(degrees: f64) -> f64 {
    let wrapped = (degrees + 180.0) % 360.0;
    if wrapped < 0.0 {
        wrapped + 360.0 - 180.0
    } else {
        wrapped - 180.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_angle() {
        assert_eq!(normalize_angle(0.0), 0.0);
        assert_eq!(normalize_angle(360.0), 0.0);
        assert_eq!(normalize_angle(370.0), 10.0);
        assert_eq!(normalize_angle(-10.0), 350.0);
        assert_eq!(normalize_angle(-370.0), 350.0);
        assert_eq!(normalize_angle(725.0), 5.0);
    }

    #[test]
    fn test_bearing_cardinal_directions() {
        let origin = GeoPoint::new(0.0, 0.0);

        let north = bearing(&origin, &GeoPoint::new(1.0, 0.0));
        assert!(north.abs() < 1e-9, "north bearing {} not ~0", north);

        let east = bearing(&origin, &GeoPoint::new(0.0, 1.0));
        assert!((east - 90.0).abs() < 1e-9, "east bearing {} not ~90", east);

        let south = bearing(&origin, &GeoPoint::new(-1.0, 0.0));
        assert!((south - 180.0).abs() < 1e-9, "south bearing {} not ~180", south);

        let west = bearing(&origin, &GeoPoint::new(0.0, -1.0));
        assert!((west - 270.0).abs() < 1e-9, "west bearing {} not ~270", west);
    }

    #[test]
    fn test_bearing_identical_points_guarded() {
        let p = GeoPoint::new(48.137, 11.576);
        assert_eq!(bearing(&p, &p), 0.0);

        // Same at the pole, where the formula is most fragile
        let pole = GeoPoint::new(90.0, 0.0);
        assert!(!bearing(&pole, &pole).is_nan());
    }

    #[test]
    fn test_distance_known_value() {
        // One degree of longitude at the equator is ~111.19 km on the
        // 6371 km sphere.
        let a = GeoPoint::new(0.0, 0.0);
        let b = GeoPoint::new(0.0, 1.0);
        let d = distance(&a, &b);
        assert!((d - 111_195.0).abs() < 100.0, "distance {} out of range", d);
    }

    #[test]
    fn test_distance_zero_for_same_point() {
        let p = GeoPoint::new(52.52, 13.405);
        assert_eq!(distance(&p, &p), 0.0);
    }

    #[test]
    fn test_destination_round_trip() {
        let from = GeoPoint::new(48.137, 11.576);
        let to = GeoPoint::new(48.2, 11.7);

        let b = bearing(&from, &to);
        let d = distance(&from, &to);
        let projected = destination(&from, b, d);

        assert!(
            projected.approx_eq(&to, 1e-6),
            "projected {} != expected {}",
            projected,
            to
        );
    }

    #[test]
    fn test_direction_centers() {
        assert_eq!(direction(0.0), CompassDirection::North);
        assert_eq!(direction(45.0), CompassDirection::NorthEast);
        assert_eq!(direction(90.0), CompassDirection::East);
        assert_eq!(direction(135.0), CompassDirection::SouthEast);
        assert_eq!(direction(180.0), CompassDirection::South);
        assert_eq!(direction(225.0), CompassDirection::SouthWest);
        assert_eq!(direction(270.0), CompassDirection::West);
        assert_eq!(direction(315.0), CompassDirection::NorthWest);
    }

    #[test]
    fn test_direction_boundaries() {
        // Boundary values belong to the sector they open
        assert_eq!(direction(22.5), CompassDirection::NorthEast);
        assert_eq!(direction(67.5), CompassDirection::East);
        assert_eq!(direction(337.5), CompassDirection::North);
        // Just below the boundary stays in the previous sector
        assert_eq!(direction(22.499), CompassDirection::North);
    }

    #[test]
    fn test_direction_wraps() {
        assert_eq!(direction(360.0), CompassDirection::North);
        assert_eq!(direction(-45.0), CompassDirection::NorthWest);
        assert_eq!(direction(720.0 + 90.0), CompassDirection::East);
    }

    proptest! {
        #[test]
        fn prop_bearing_in_range(
            lat1 in -89.0f64..89.0,
            lon1 in -180.0f64..180.0,
            lat2 in -89.0f64..89.0,
            lon2 in -180.0f64..180.0,
        ) {
            let b = bearing(&GeoPoint::new(lat1, lon1), &GeoPoint::new(lat2, lon2));
            prop_assert!((0.0..360.0).contains(&b), "bearing {} out of range", b);
        }

        #[test]
        fn prop_normalize_in_range(a in -10_000.0f64..10_000.0) {
            let n = normalize_angle(a);
            prop_assert!((0.0..360.0).contains(&n));
        }

        #[test]
        fn prop_direction_total(b in 0.0f64..360.0) {
            // Bucketing is total over [0, 360): every bearing maps to a label
            let _ = direction(b).label();
        }

        #[test]
        fn prop_distance_non_negative(
            lat1 in -89.0f64..89.0,
            lon1 in -180.0f64..180.0,
            lat2 in -89.0f64..89.0,
            lon2 in -180.0f64..180.0,
        ) {
            let d = distance(&GeoPoint::new(lat1, lon1), &GeoPoint::new(lat2, lon2));
            prop_assert!(d >= 0.0);
        }
    }
}
