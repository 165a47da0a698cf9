//! # Route Analyser
//!
//! Route-aware analysis of live GPS fixes for multi-rider endurance events.
//!
//! This library provides:
//! - Route preparation: cumulative distances, per-segment geodesic precalculation and a
//!   Ramer–Douglas–Peucker simplified tier for fast searching
//! - Closest point-pair search over one or many routes, with route-order tie breaking
//! - An optional persistent cache of search results
//! - A per-rider streaming analyser that annotates fixes with route distance, track
//!   segments, distance ridden, speed and an Active / Inactive / Finished status
//!
//! ## Features
//!
//! - **`stream`** (default) - Tracker substrate and the async per-rider analyser
//! - **`parallel`** - Prepare routes in parallel with rayon
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use route_analyser::{GeoPoint, RouteOptions, closest, prepare_routes};
//!
//! let routes = prepare_routes(vec![RouteOptions::new(vec![
//!     [-26.300420, 28.049410],
//!     [-26.315691, 28.062354],
//!     [-26.322250, 28.042440],
//! ])])
//! .unwrap();
//!
//! let fix = GeoPoint::new(-26.300824, 28.050185);
//! let hit = closest::closest_on_routes(&routes, &fix, 1000.0, None, 250.0, Some(0.0)).unwrap();
//! assert_eq!(closest::route_distance(&hit), 82.0);
//! ```

use nalgebra::Vector3;
use std::sync::OnceLock;

pub mod error;
pub use error::{CacheError, RouteError, TrackerError};

pub mod geo_utils;

// Route preparation (distances, precalc, simplification, secondary linkage)
pub mod route;
pub use route::{PreparedRoute, RouteOptions, prepare_route, prepare_routes};

// Closest point-pair search
pub mod closest;
pub use closest::{ClosestPointPairHit, PointPairPrecalc, find_c_point};

// Persistent memoization of closest point-pair searches
pub mod cache;
pub use cache::ClosestCache;

#[cfg(feature = "stream")]
pub mod tracker;
#[cfg(feature = "stream")]
pub use tracker::{Fix, Position, Status, Subscription, Tracker};

#[cfg(feature = "stream")]
pub mod analyse;
#[cfg(feature = "stream")]
pub use analyse::{AnalyseConfig, AnalyseTracker, PredictedPosition};

// ============================================================================
// Core Types
// ============================================================================

/// A WGS-84 latitude/longitude in degrees.
///
/// The n-vector and the earth-centred position vector are computed on first use and
/// cached, as the simplification and search paths ask for them many times over.
/// Equality compares latitude and longitude only.
///
/// # Example
/// ```
/// use route_analyser::GeoPoint;
/// let point = GeoPoint::new(-26.300822, 28.049444);
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Default)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
    nv: OnceLock<Vector3<f64>>,
    pv: OnceLock<Vector3<f64>>,
}

impl GeoPoint {
    /// Create a new point.
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng, nv: OnceLock::new(), pv: OnceLock::new() }
    }

    /// Create a point from an n-vector, keeping the vector as the cached n-vector.
    pub fn from_nvec(nv: Vector3<f64>) -> Self {
        let (lat, lng) = geo_utils::from_nvec(&nv);
        let point = Self::new(lat, lng);
        let _ = point.nv.set(nv);
        point
    }

    /// Unit n-vector of this point.
    pub fn nv(&self) -> Vector3<f64> {
        *self.nv.get_or_init(|| geo_utils::to_nvec(self.lat, self.lng))
    }

    /// Earth-centred position vector on the WGS-84 ellipsoid, in meters.
    pub fn pv(&self) -> Vector3<f64> {
        *self.pv.get_or_init(|| geo_utils::nvec_to_pvec(&self.nv()))
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// Distance in meters to another point.
    pub fn distance_to(&self, other: &GeoPoint) -> f64 {
        geo_utils::distance(self, other)
    }
}

impl PartialEq for GeoPoint {
    fn eq(&self, other: &Self) -> bool {
        self.lat == other.lat && self.lng == other.lng
    }
}

impl From<[f64; 2]> for GeoPoint {
    fn from([lat, lng]: [f64; 2]) -> Self {
        Self::new(lat, lng)
    }
}

impl AsRef<GeoPoint> for GeoPoint {
    fn as_ref(&self) -> &GeoPoint {
        self
    }
}

/// A point of a prepared route.
///
/// `index` is the position in the route's point list and `distance` the cumulative
/// route distance in meters from the route start.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedPoint {
    pub point: GeoPoint,
    pub index: usize,
    pub distance: f64,
}

impl IndexedPoint {
    pub fn new(point: GeoPoint, index: usize, distance: f64) -> Self {
        Self { point, index, distance }
    }
}

impl AsRef<GeoPoint> for IndexedPoint {
    fn as_ref(&self) -> &GeoPoint {
        &self.point
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geo_point_validation() {
        assert!(GeoPoint::new(-26.3, 28.05).is_valid());
        assert!(!GeoPoint::new(91.0, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, 181.0).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_equality_ignores_cached_vectors() {
        let a = GeoPoint::new(-26.3, 28.05);
        let b = GeoPoint::new(-26.3, 28.05);
        a.pv();
        assert_eq!(a, b);
        assert_ne!(a, GeoPoint::new(-26.3, 28.0501));
    }

    #[test]
    fn test_from_nvec_keeps_vector() {
        let nv = geo_utils::to_nvec(10.0, 20.0);
        let point = GeoPoint::from_nvec(nv);
        assert!((point.lat - 10.0).abs() < 1e-9);
        assert!((point.lng - 20.0).abs() < 1e-9);
        assert_eq!(point.nv(), nv);
    }

    #[test]
    fn test_pv_is_cached() {
        let point = GeoPoint::new(-26.3, 28.05);
        assert_eq!(point.pv(), point.pv());
        assert!((point.pv().norm() - 6_375_000.0).abs() < 5_000.0);
    }
}
