//! # Closest Point-Pair Search
//!
//! Finds the route segment nearest to a GPS fix and the fix's projection onto it.
//!
//! ## Algorithm
//! 1. Project the fix onto every pair of the route's simplified tier
//! 2. Rank the candidates, preferring ones whose along-route position is close to the
//!    rider's previous along-route position
//! 3. Unless the winner is already far away (or cannot be refined), re-search only the
//!    detailed pairs it spans
//! 4. Across routes, try the main route and the previously matched route first and stop
//!    early when one of them is close enough
//!
//! Projection is done on the great circle through each pair using n-vectors, falling
//! back to the nearest endpoint when the foot of the perpendicular is outside the pair.

use nalgebra::Vector3;

use crate::geo_utils::{arccos_safe, cross, distance, unit};
use crate::route::PreparedRoute;
use crate::{GeoPoint, IndexedPoint};

/// Tolerance (radians) for accepting a projection as lying between the pair's ends.
const ON_SEGMENT_TOLERANCE: f64 = 0.000_001;

/// Along-route move (meters) at which the ranking penalty reaches 1 m.
const MOVE_PENALTY_OFFSET: f64 = 50_000.0;

/// Along-route move (meters) that doubles the ranking penalty.
const MOVE_PENALTY_SCALE: f64 = 1_000.0;

// =============================================================================
// Types
// =============================================================================

/// Precomputed geodesic helpers for an ordered pair of consecutive route points.
#[derive(Debug, Clone)]
pub struct PointPairPrecalc {
    pub a: IndexedPoint,
    pub b: IndexedPoint,
    /// `a.nv × b.nv`, the normal of the pair's great circle
    pub c12: Vector3<f64>,
    pub a_flat: Vector3<f64>,
    pub b_flat: Vector3<f64>,
    /// Angular length of the pair (radians)
    pub d_ab: f64,
}

impl PointPairPrecalc {
    pub fn new(a: &IndexedPoint, b: &IndexedPoint) -> Self {
        let (c12, a_flat, b_flat, d_ab) = precalc(&a.point, &b.point);
        Self { a: a.clone(), b: b.clone(), c12, a_flat, b_flat, d_ab }
    }

    /// Project `to_point` onto this pair.
    pub fn c_point(&self, to_point: &GeoPoint) -> CPoint {
        c_point(
            to_point,
            &self.a.point,
            &self.b.point,
            &self.c12,
            &self.a_flat,
            &self.b_flat,
            self.d_ab,
        )
    }
}

/// Build the precalculated pairs for consecutive points.
pub fn point_pairs(points: &[IndexedPoint]) -> Vec<PointPairPrecalc> {
    points
        .windows(2)
        .map(|w| PointPairPrecalc::new(&w[0], &w[1]))
        .collect()
}

/// Projection of a point onto a pair.
#[derive(Debug, Clone, PartialEq)]
pub struct CPoint {
    /// Distance in meters from the query point to `point`
    pub dist: f64,
    /// Projected point, or the nearest pair endpoint
    pub point: GeoPoint,
}

/// Best pair on a single route.
#[derive(Debug, Clone)]
pub struct PairHit<'a> {
    pub point_pair: &'a PointPairPrecalc,
    pub dist: f64,
    pub point: GeoPoint,
}

/// Best pair across a set of routes.
#[derive(Debug, Clone)]
pub struct ClosestPointPairHit<'a> {
    pub route_index: usize,
    pub route: &'a PreparedRoute,
    pub point_pair: &'a PointPairPrecalc,
    /// Distance in meters from the query point to `point`
    pub dist: f64,
    pub point: GeoPoint,
}

impl<'a> ClosestPointPairHit<'a> {
    fn from_pair_hit(route_index: usize, route: &'a PreparedRoute, hit: PairHit<'a>) -> Self {
        Self {
            route_index,
            route,
            point_pair: hit.point_pair,
            dist: hit.dist,
            point: hit.point,
        }
    }
}

// =============================================================================
// Cross-Track Projection
// =============================================================================

pub(crate) fn precalc(a: &GeoPoint, b: &GeoPoint) -> (Vector3<f64>, Vector3<f64>, Vector3<f64>, f64) {
    let a_nv = a.nv();
    let b_nv = b.nv();
    let c12 = cross(&a_nv, &b_nv);
    let d_ab = arccos_safe(a_nv.dot(&b_nv));
    (c12, a_nv, b_nv, d_ab)
}

/// Project `to_point` onto the great-circle segment `a`-`b`.
///
/// Returns the projection and its distance when it lies between `a` and `b`, otherwise
/// the nearer of `a` and `b`.
///
/// # Example
///
/// ```rust
/// use route_analyser::{GeoPoint, find_c_point};
///
/// let c = find_c_point(&GeoPoint::new(0.0001, 15.0), &GeoPoint::new(0.0, 0.0), &GeoPoint::new(0.0, 30.0));
/// assert!((c.dist - 11.057).abs() < 0.001);
/// assert!((c.point.lng - 15.0).abs() < 1e-9);
/// ```
pub fn find_c_point(to_point: &GeoPoint, a: &GeoPoint, b: &GeoPoint) -> CPoint {
    let (c12, a_flat, b_flat, d_ab) = precalc(a, b);
    c_point(to_point, a, b, &c12, &a_flat, &b_flat, d_ab)
}

pub(crate) fn c_point(
    to_point: &GeoPoint,
    a: &GeoPoint,
    b: &GeoPoint,
    c12: &Vector3<f64>,
    a_flat: &Vector3<f64>,
    b_flat: &Vector3<f64>,
    d_ab: f64,
) -> CPoint {
    let ctp = cross(&to_point.nv(), c12);
    // Zero when a == b, or when the query is a pole of the pair's great circle.
    if let Some(c) = unit(&cross(&ctp, c12)) {
        for candidate in [c, -c] {
            let d_ac = arccos_safe(a_flat.dot(&candidate));
            let d_bc = arccos_safe(b_flat.dot(&candidate));
            if (d_ac + d_bc - d_ab).abs() < ON_SEGMENT_TOLERANCE {
                let point = GeoPoint::from_nvec(candidate);
                return CPoint { dist: distance(to_point, &point), point };
            }
        }
    }

    let dist_a = distance(to_point, a);
    let dist_b = distance(to_point, b);
    if dist_a <= dist_b {
        CPoint { dist: dist_a, point: a.clone() }
    } else {
        CPoint { dist: dist_b, point: b.clone() }
    }
}

// =============================================================================
// Route Distance
// =============================================================================

/// Along-route distance (rounded meters) of a projection onto `point_pair`.
///
/// Secondary routes report the main-route equivalent distance.
pub fn route_distance_of(route: &PreparedRoute, point_pair: &PointPairPrecalc, point: &GeoPoint) -> f64 {
    let prev = &point_pair.a;
    let d = prev.distance + distance(&prev.point, point);
    match &route.link {
        Some(link) if !route.main => (d * link.dist_factor + link.start_distance).round(),
        _ => d.round(),
    }
}

/// Along-route distance (rounded meters) of a hit.
pub fn route_distance(hit: &ClosestPointPairHit<'_>) -> f64 {
    route_distance_of(hit.route, hit.point_pair, &hit.point)
}

/// Ranking used to pick between candidates on a route.
///
/// The penalty is under 1 m for along-route moves of ~30 km and explodes past 50 km,
/// which keeps a rider from jumping to a nearby but route-distant segment.
fn rank(route: &PreparedRoute, hit: &PairHit<'_>, prev_dist: Option<f64>) -> f64 {
    match prev_dist {
        None => hit.dist,
        Some(prev_dist) => {
            let moved = (route_distance_of(route, hit.point_pair, &hit.point) - prev_dist).abs();
            hit.dist + 2f64.powf((moved - MOVE_PENALTY_OFFSET) / MOVE_PENALTY_SCALE)
        }
    }
}

fn best_pair<'a>(
    route: &PreparedRoute,
    pairs: &'a [PointPairPrecalc],
    to_point: &GeoPoint,
    prev_dist: Option<f64>,
) -> Option<PairHit<'a>> {
    pairs
        .iter()
        .map(|point_pair| {
            let CPoint { dist, point } = point_pair.c_point(to_point);
            PairHit { point_pair, dist, point }
        })
        .map(|hit| (rank(route, &hit, prev_dist), hit))
        .min_by(|(r1, _), (r2, _)| r1.total_cmp(r2))
        .map(|(_, hit)| hit)
}

// =============================================================================
// Search
// =============================================================================

/// Find the closest pair on a single route.
///
/// The simplified tier is searched first. When its winner is within
/// `min_complex_dist` and spans more than one detailed pair, only those detailed pairs
/// are searched again.
pub fn closest_on_route<'a>(
    route: &'a PreparedRoute,
    to_point: &GeoPoint,
    min_complex_dist: f64,
    prev_dist: Option<f64>,
) -> Option<PairHit<'a>> {
    let simplified = best_pair(route, &route.simplified_point_pairs, to_point, prev_dist)?;
    let start = simplified.point_pair.a.index;
    let end = simplified.point_pair.b.index;
    if simplified.dist > min_complex_dist || end - start <= 1 {
        return Some(simplified);
    }

    let end = (end + 1).min(route.point_pairs.len());
    best_pair(route, &route.point_pairs[start..end], to_point, prev_dist).or(Some(simplified))
}

/// Find the closest pair across `routes`.
///
/// The main route and `prev_route_index` are searched first (previous route first). If
/// the better of those is closer than `break_out_dist` it is returned straight away.
/// Otherwise every route is searched and the closest hit wins.
///
/// # Panics
///
/// If `prev_route_index` is not an index into `routes`.
pub fn closest_on_routes<'a>(
    routes: &'a [PreparedRoute],
    to_point: &GeoPoint,
    min_complex_dist: f64,
    prev_route_index: Option<usize>,
    break_out_dist: f64,
    prev_dist: Option<f64>,
) -> Option<ClosestPointPairHit<'a>> {
    if routes.is_empty() {
        return None;
    }

    let mut priority = vec![0];
    if let Some(i) = prev_route_index.filter(|&i| i != 0) {
        assert!(i < routes.len(), "previous route {i} of {} routes", routes.len());
        priority.push(i);
    }

    let search = |route_index: usize| {
        let route = &routes[route_index];
        closest_on_route(route, to_point, min_complex_dist, prev_dist)
            .map(|hit| ClosestPointPairHit::from_pair_hit(route_index, route, hit))
    };

    let mut results: Vec<ClosestPointPairHit<'a>> = priority.iter().rev().filter_map(|&i| search(i)).collect();
    let best_priority = results.iter().min_by(|a, b| a.dist.total_cmp(&b.dist));
    if best_priority.is_some_and(|hit| hit.dist < break_out_dist) {
        return results.into_iter().min_by(|a, b| a.dist.total_cmp(&b.dist));
    }

    results.extend(
        (0..routes.len())
            .filter(|i| !priority.contains(i))
            .filter_map(search),
    );

    results.into_iter().min_by(|a, b| a.dist.total_cmp(&b.dist))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{RouteOptions, prepare_route, prepare_routes};

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    fn simple_route() -> PreparedRoute {
        prepare_route(RouteOptions::new(vec![
            [-26.300420, 28.049410],
            [-26.315691, 28.062354],
            [-26.322250, 28.042440],
        ]))
        .unwrap()
    }

    fn alt_routes() -> Vec<PreparedRoute> {
        prepare_routes(vec![
            RouteOptions::new(vec![
                [-26.300420, 28.049410],
                [-26.315685, 28.062377],
                [-26.381378, 28.067689],
                [-26.417153, 28.072707],
            ]),
            RouteOptions::new(vec![
                [-26.315685, 28.062377],
                [-26.324918, 27.985781],
                [-26.381378, 28.067689],
            ]),
        ])
        .unwrap()
    }

    #[test]
    fn test_find_c_point_between() {
        let c = find_c_point(
            &GeoPoint::new(0.0001, 15.0),
            &GeoPoint::new(0.0, 0.0),
            &GeoPoint::new(0.0, 30.0),
        );
        assert!(approx_eq(c.dist, 11.057_427, 0.000_01));
        assert!(approx_eq(c.point.lat, 0.0, 1e-9));
        assert!(approx_eq(c.point.lng, 15.0, 1e-9));
    }

    #[test]
    fn test_find_c_point_outside() {
        let c = find_c_point(
            &GeoPoint::new(0.0001, 40.0),
            &GeoPoint::new(0.0, 0.0),
            &GeoPoint::new(0.0, 30.0),
        );
        assert_eq!(c.point, GeoPoint::new(0.0, 30.0));
        assert!(approx_eq(c.dist, distance(&GeoPoint::new(0.0001, 40.0), &GeoPoint::new(0.0, 30.0)), 1e-9));
    }

    #[test]
    fn test_find_c_point_degenerate_pair() {
        let a = GeoPoint::new(-26.3, 28.05);
        let to_point = GeoPoint::new(-26.301, 28.05);
        let c = find_c_point(&to_point, &a, &a);
        assert_eq!(c.point, a);
        assert!(approx_eq(c.dist, distance(&to_point, &a), 1e-9));
    }

    #[test]
    fn test_c_point_never_beyond_endpoints() {
        let route = simple_route();
        let queries = [
            GeoPoint::new(-26.300824, 28.050185),
            GeoPoint::new(-26.31, 28.0),
            GeoPoint::new(-26.4, 28.1),
            GeoPoint::new(-26.322167, 28.042920),
        ];
        for q in &queries {
            for pair in &route.point_pairs {
                let c = pair.c_point(q);
                let nearest_end = distance(q, &pair.a.point).min(distance(q, &pair.b.point));
                assert!(c.dist <= nearest_end + 0.001);
            }
        }
    }

    #[test]
    fn test_closest_on_route_start() {
        let routes = vec![simple_route()];
        let hit = closest_on_routes(&routes, &GeoPoint::new(-26.300824, 28.050185), 1000.0, None, 250.0, Some(0.0))
            .unwrap();
        assert_eq!(hit.route_index, 0);
        assert_eq!(route_distance(&hit), 82.0);
        assert!(approx_eq(hit.dist, 34.33, 0.01));
    }

    #[test]
    fn test_closest_on_route_finish() {
        let routes = vec![simple_route()];
        let hit = closest_on_routes(&routes, &GeoPoint::new(-26.322167, 28.042920), 1000.0, Some(0), 250.0, Some(82.0))
            .unwrap();
        assert_eq!(route_distance(&hit), 4198.0);
        let last = routes[0].points.last().unwrap().distance;
        assert!((route_distance(&hit) - last).abs() < 100.0);
    }

    #[test]
    fn test_returned_dist_matches_projection() {
        let routes = alt_routes();
        for q in [
            GeoPoint::new(-26.300824, 28.050185),
            GeoPoint::new(-26.325051, 27.985600),
            GeoPoint::new(-26.417149, 28.073087),
        ] {
            let hit = closest_on_routes(&routes, &q, 1000.0, None, 250.0, Some(0.0)).unwrap();
            let c = find_c_point(&q, &hit.point_pair.a.point, &hit.point_pair.b.point);
            assert!(approx_eq(hit.dist, c.dist, 1e-6));
        }
    }

    #[test]
    fn test_alternate_route_distance() {
        let routes = alt_routes();
        let hit = closest_on_routes(&routes, &GeoPoint::new(-26.325051, 27.985600), 1000.0, Some(0), 250.0, Some(82.0))
            .unwrap();
        assert_eq!(hit.route_index, 1);
        assert_eq!(route_distance(&hit), 5256.0);

        let hit = closest_on_routes(&routes, &GeoPoint::new(-26.417149, 28.073087), 1000.0, Some(1), 250.0, Some(5256.0))
            .unwrap();
        assert_eq!(hit.route_index, 0);
        assert_eq!(route_distance(&hit), 13423.0);
    }

    #[test]
    fn test_break_out_on_priority_route() {
        let routes = alt_routes();
        let on_alternate = GeoPoint::new(-26.325051, 27.985600);

        // Any main route hit is good enough, so the alternate is never searched
        let hit = closest_on_routes(&routes, &on_alternate, 1000.0, None, f64::INFINITY, None).unwrap();
        assert_eq!(hit.route_index, 0);
        assert!(hit.dist > 5000.0);

        let hit = closest_on_routes(&routes, &on_alternate, 1000.0, None, 250.0, None).unwrap();
        assert_eq!(hit.route_index, 1);
        assert!(hit.dist < 100.0);
    }

    #[test]
    #[should_panic(expected = "previous route 5 of 2 routes")]
    fn test_unknown_prev_route_panics() {
        let routes = alt_routes();
        closest_on_routes(&routes, &GeoPoint::new(-26.300824, 28.050185), 1000.0, Some(5), 250.0, None);
    }

    #[test]
    fn test_prev_dist_breaks_ties_on_circular_route() {
        let mut options = RouteOptions::new(vec![
            [-27.881250, 27.919840],
            [-27.862210, 27.917000],
            [-27.743550, 27.942480],
            [-27.843790, 28.164510],
            [-27.945580, 28.044930],
            [-27.880490, 27.917450],
            [-27.860440, 27.918080],
            [-27.779830, 27.746380],
            [-27.900190, 27.668620],
            [-28.043810, 27.969710],
            [-27.933350, 28.028700],
            [-27.881250, 27.919840],
        ]);
        options.split_at_dist = vec![35_000.0, 115_000.0];
        options.split_point_range = 10_000.0;
        let routes = vec![prepare_route(options).unwrap()];
        let start = GeoPoint::new(-27.880490, 27.917450);

        // Near the start of the event the rider is at the start of the loop ...
        let hit = closest_on_routes(&routes, &start, 1000.0, None, 250.0, Some(0.0)).unwrap();
        assert_eq!(route_distance(&hit), 114.0);

        // ... and at the end of it after riding it.
        let hit = closest_on_routes(&routes, &start, 1000.0, Some(0), 250.0, Some(141_196.0)).unwrap();
        assert_eq!(route_distance(&hit), 166_916.0);

        // Without a previous distance the geometrically closest pair wins.
        let hit = closest_on_routes(&routes, &start, 1000.0, None, 250.0, None).unwrap();
        assert!(hit.dist < 0.01);
    }

    #[test]
    fn test_no_routes() {
        assert!(closest_on_routes(&[], &GeoPoint::new(0.0, 0.0), 1000.0, None, 250.0, None).is_none());
    }
}
