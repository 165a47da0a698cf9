//! # Geodesic Utilities
//!
//! n-vector based geodesy used by route preparation and the closest-pair search.
//!
//! ## Overview
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`to_nvec`] | Latitude/longitude (degrees) to a unit n-vector |
//! | [`from_nvec`] | n-vector back to latitude/longitude (degrees) |
//! | [`nvec_to_pvec`] | n-vector to an earth-centred position vector on the WGS-84 ellipsoid |
//! | [`distance`] | Straight-line distance between two position vectors (meters) |
//! | [`arccos_safe`] | `acos` that clamps its argument into `[-1, 1]` |
//! | [`cross`] | 3-vector cross product |
//! | [`polyline_length`] | Total length of a sequence of points |
//!
//! ## Example
//!
//! ```rust
//! use route_analyser::{GeoPoint, geo_utils};
//!
//! let track = vec![
//!     GeoPoint::new(-26.300822, 28.049444),
//!     GeoPoint::new(-26.302245, 28.051139),
//! ];
//!
//! let length = geo_utils::polyline_length(&track);
//! assert!((length - 231.3).abs() < 0.1);
//! ```
//!
//! ## Coordinate System
//!
//! n-vectors use the usual earth-centred frame: `x` through (0°, 0°), `y` through
//! (0°, 90°E) and `z` through the north pole. Position vectors sit on the WGS-84
//! ellipsoid surface, so [`distance`] is a chord length. For the short hops between
//! consecutive fixes or route points the chord and the arc agree to well under a
//! millimetre.

use nalgebra::Vector3;

use crate::GeoPoint;

/// WGS-84 semi-major axis in meters.
pub const WGS84_A: f64 = 6_378_137.0;

/// WGS-84 flattening.
pub const WGS84_F: f64 = 1.0 / 298.257_223_563;

// =============================================================================
// n-vector Conversions
// =============================================================================

/// Convert a latitude/longitude in degrees to a unit n-vector.
///
/// # Panics
///
/// Panics on non-finite input. A NaN coordinate is a bug in the caller and
/// must not leak into the search as a silently wrong distance.
#[inline]
pub fn to_nvec(lat: f64, lng: f64) -> Vector3<f64> {
    assert!(
        lat.is_finite() && lng.is_finite(),
        "non-finite coordinate ({lat}, {lng})"
    );
    let lat = lat.to_radians();
    let lng = lng.to_radians();
    Vector3::new(lat.cos() * lng.cos(), lat.cos() * lng.sin(), lat.sin())
}

/// Convert an n-vector back to a latitude/longitude pair in degrees.
///
/// The vector does not need to be exactly unit length.
#[inline]
pub fn from_nvec(nv: &Vector3<f64>) -> (f64, f64) {
    let lat = nv.z.atan2(nv.x.hypot(nv.y));
    let lng = nv.y.atan2(nv.x);
    (lat.to_degrees(), lng.to_degrees())
}

/// Scale an n-vector onto the WGS-84 ellipsoid surface.
pub fn nvec_to_pvec(nv: &Vector3<f64>) -> Vector3<f64> {
    let b = WGS84_A * (1.0 - WGS84_F);
    let k = (1.0 - WGS84_F).powi(2);
    let denominator = (nv.z * nv.z + (nv.x * nv.x + nv.y * nv.y) / k).sqrt();
    let scale = b / denominator;
    Vector3::new(scale * nv.x / k, scale * nv.y / k, scale * nv.z)
}

// =============================================================================
// Vector Helpers
// =============================================================================

/// `acos` with its argument clamped into `[-1, 1]`.
///
/// Dot products of unit vectors drift a few ULPs past ±1; without the clamp
/// `acos` would return NaN.
#[inline]
pub fn arccos_safe(x: f64) -> f64 {
    x.clamp(-1.0, 1.0).acos()
}

#[inline]
pub fn cross(a: &Vector3<f64>, b: &Vector3<f64>) -> Vector3<f64> {
    a.cross(b)
}

/// Normalize a vector, or `None` for a zero-length one.
#[inline]
pub fn unit(v: &Vector3<f64>) -> Option<Vector3<f64>> {
    v.try_normalize(f64::MIN_POSITIVE)
}

/// Interpolate between two n-vectors at `t` (0 = `a`, 1 = `b`).
///
/// # Panics
///
/// Panics when `a` and `b` are antipodal at `t = 0.5`, which has no defined midpoint.
pub fn interpolate(a: &Vector3<f64>, b: &Vector3<f64>, t: f64) -> Vector3<f64> {
    let v = a + (b - a) * t;
    unit(&v).expect("interpolation between antipodal n-vectors")
}

// =============================================================================
// Distance Functions
// =============================================================================

/// Distance in meters between two points, measured between their position vectors.
///
/// # Example
///
/// ```rust
/// use route_analyser::{GeoPoint, geo_utils};
///
/// let a = GeoPoint::new(0.0, 0.0);
/// let b = GeoPoint::new(0.0001, 0.0);
/// assert!((geo_utils::distance(&a, &b) - 11.057).abs() < 0.001);
/// ```
#[inline]
pub fn distance(p: &GeoPoint, q: &GeoPoint) -> f64 {
    (p.pv() - q.pv()).norm()
}

/// Total length of a polyline in meters. Empty and single point inputs return 0.
pub fn polyline_length(points: &[GeoPoint]) -> f64 {
    points.windows(2).map(|w| distance(&w[0], &w[1])).sum()
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    #[test]
    fn test_small_step_distance() {
        let a = GeoPoint::new(0.0, 0.0);
        let b = GeoPoint::new(0.0001, 0.0);
        assert!(approx_eq(distance(&a, &b), 11.057, 0.001));
    }

    #[test]
    fn test_distance_same_point() {
        let p = GeoPoint::new(-26.300822, 28.049444);
        assert_eq!(distance(&p, &p), 0.0);
    }

    #[test]
    fn test_distance_known_values() {
        let a = GeoPoint::new(-26.300822, 28.049444);
        let b = GeoPoint::new(-26.302245, 28.051139);
        let c = GeoPoint::new(-27.280315, 27.969365);
        assert!(approx_eq(distance(&a, &b), 231.314, 0.01));
        assert!(approx_eq(distance(&b, &c), 108_673.707, 0.01));
    }

    #[test]
    fn test_nvec_round_trip() {
        for &(lat, lng) in &[(0.0, 0.0), (-26.3, 28.05), (51.5074, -0.1278), (89.9, 179.9)] {
            let (lat2, lng2) = from_nvec(&to_nvec(lat, lng));
            assert!(approx_eq(lat, lat2, 1e-9));
            assert!(approx_eq(lng, lng2, 1e-9));
        }
    }

    #[test]
    fn test_pvec_on_ellipsoid() {
        let equator = nvec_to_pvec(&to_nvec(0.0, 0.0));
        assert!(approx_eq(equator.norm(), WGS84_A, 1e-6));

        let pole = nvec_to_pvec(&to_nvec(90.0, 0.0));
        assert!(approx_eq(pole.norm(), WGS84_A * (1.0 - WGS84_F), 1e-6));
    }

    #[test]
    fn test_arccos_safe_clamps() {
        assert_eq!(arccos_safe(1.0 + 1e-12), 0.0);
        assert!(approx_eq(arccos_safe(-1.0 - 1e-12), std::f64::consts::PI, 1e-12));
        assert!(!arccos_safe(1.0 + 1e-12).is_nan());
    }

    #[test]
    fn test_unit_zero_vector() {
        assert!(unit(&Vector3::zeros()).is_none());
        let v = unit(&Vector3::new(3.0, 0.0, 4.0)).unwrap();
        assert!(approx_eq(v.norm(), 1.0, 1e-12));
    }

    #[test]
    fn test_interpolate_midpoint() {
        let a = to_nvec(0.0, 0.0);
        let b = to_nvec(0.0, 10.0);
        let (lat, lng) = from_nvec(&interpolate(&a, &b, 0.5));
        assert!(approx_eq(lat, 0.0, 1e-9));
        assert!(approx_eq(lng, 5.0, 1e-9));
    }

    #[test]
    fn test_polyline_length() {
        let empty: Vec<GeoPoint> = vec![];
        assert_eq!(polyline_length(&empty), 0.0);

        let track = vec![
            GeoPoint::new(-26.300822, 28.049444),
            GeoPoint::new(-26.302245, 28.051139),
            GeoPoint::new(-26.302245, 28.051139),
        ];
        assert!(approx_eq(polyline_length(&track), 231.314, 0.01));
    }

    #[test]
    #[should_panic]
    fn test_nan_coordinate_panics() {
        to_nvec(f64::NAN, 0.0);
    }
}
