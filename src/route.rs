//! # Route Preparation
//!
//! Turns raw route geometry into a [`PreparedRoute`] ready for closest-pair searches.
//!
//! ## Steps
//! 1. Drop consecutive duplicate points
//! 2. Detailed Ramer–Douglas–Peucker simplification (`rdp_epsilon`, a couple of meters)
//! 3. Index the points and accumulate route distance
//! 4. Precalculate every consecutive point pair
//! 5. Build the coarse search tier: RDP at 500 m, optionally split into sections anchored
//!    near given route distances so loops and out-and-backs keep their shape
//! 6. For event route sets, link every secondary route onto the main route
//!
//! Prepared routes are immutable and meant to be shared read-only by every rider.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::closest::{self, PointPairPrecalc};
use crate::error::RouteError;
use crate::geo_utils::{distance, interpolate};
use crate::{GeoPoint, IndexedPoint};

/// Epsilon (meters) for the simplified search tier.
pub const SIMPLIFIED_EPSILON: f64 = 500.0;

fn default_rdp_epsilon() -> f64 {
    2.0
}

fn default_split_point_range() -> f64 {
    500.0
}

/// Route input, as stored with an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteOptions {
    /// Ordered `[lat, lng]` pairs
    pub original_points: Vec<[f64; 2]>,
    /// Epsilon (meters) for the detailed simplification. `0` keeps every point.
    #[serde(default = "default_rdp_epsilon")]
    pub rdp_epsilon: f64,
    /// Route distances (meters) to anchor the simplified tier's sections at
    #[serde(default)]
    pub split_at_dist: Vec<f64>,
    /// Window (meters) around each split distance to look for an anchor point
    #[serde(default = "default_split_point_range")]
    pub split_point_range: f64,
    /// Precomputed simplified tier, as indexes into the detailed points
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simplified_points_indexes: Option<Vec<usize>>,
}

impl RouteOptions {
    pub fn new(original_points: Vec<[f64; 2]>) -> Self {
        Self {
            original_points,
            rdp_epsilon: default_rdp_epsilon(),
            split_at_dist: Vec::new(),
            split_point_range: default_split_point_range(),
            simplified_points_indexes: None,
        }
    }
}

/// Where a secondary route joins and leaves the main route.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteLink {
    /// Main-route distance where the secondary route starts
    pub start_distance: f64,
    /// Main-route distance where the secondary route ends
    pub end_distance: f64,
    /// `(end_distance - start_distance) / secondary route length`
    pub dist_factor: f64,
    /// Main-route point index just before the start
    pub prev_point: usize,
    /// Main-route point index just after the end
    pub next_point: usize,
}

/// A route with distances, precalculated pairs and a simplified search tier.
#[derive(Debug, Clone)]
pub struct PreparedRoute {
    pub points: Vec<IndexedPoint>,
    pub point_pairs: Vec<PointPairPrecalc>,
    pub simplified_point_pairs: Vec<PointPairPrecalc>,
    pub main: bool,
    /// Set on secondary routes once linked to the main route
    pub link: Option<RouteLink>,
}

impl PreparedRoute {
    /// Route length in meters.
    pub fn length(&self) -> f64 {
        self.points.last().map_or(0.0, |p| p.distance)
    }

    /// Indexes of the simplified tier's points.
    pub fn simplified_points_indexes(&self) -> Vec<usize> {
        let mut indexes: Vec<usize> = self.simplified_point_pairs.iter().map(|pair| pair.a.index).collect();
        if let Some(last) = self.simplified_point_pairs.last() {
            indexes.push(last.b.index);
        }
        indexes
    }
}

// =============================================================================
// Preparation
// =============================================================================

/// Prepare a single route. The route is treated as a main route.
pub fn prepare_route(options: RouteOptions) -> Result<PreparedRoute, RouteError> {
    prepare_route_at(0, options)
}

fn prepare_route_at(route_index: usize, options: RouteOptions) -> Result<PreparedRoute, RouteError> {
    let mut original_points = options.original_points;
    original_points.dedup();
    if original_points.len() < 2 {
        return Err(RouteError::TooFewPoints { route: route_index, points: original_points.len() });
    }

    let geo_points: Vec<GeoPoint> = original_points.into_iter().map(GeoPoint::from).collect();
    let geo_points: Vec<GeoPoint> = if options.rdp_epsilon > 0.0 {
        rdp_indexes(&geo_points, options.rdp_epsilon)
            .into_iter()
            .map(|i| geo_points[i].clone())
            .collect()
    } else {
        geo_points
    };

    let points = with_distance_and_index(geo_points);
    let point_pairs = closest::point_pairs(&points);

    let simplified_points: Vec<IndexedPoint> = match options.simplified_points_indexes {
        Some(indexes) => {
            if let Some(&index) = indexes.iter().find(|&&i| i >= points.len()) {
                return Err(RouteError::SimplifiedIndex { route: route_index, index, len: points.len() });
            }
            let last = points.len() - 1;
            let ordered = indexes.windows(2).all(|w| w[0] < w[1]);
            if indexes.len() < 2 || indexes[0] != 0 || indexes[indexes.len() - 1] != last || !ordered {
                return Err(RouteError::SimplifiedIndexOrder { route: route_index, last });
            }
            indexes.into_iter().map(|i| points[i].clone()).collect()
        }
        None if options.split_at_dist.is_empty() => rdp(&points, SIMPLIFIED_EPSILON),
        None => rdp_sections(&points, SIMPLIFIED_EPSILON, &options.split_at_dist, options.split_point_range),
    };
    let simplified_point_pairs = closest::point_pairs(&simplified_points);

    let route = PreparedRoute {
        points,
        point_pairs,
        simplified_point_pairs,
        main: true,
        link: None,
    };
    debug!(
        "Route {}: {} points, {} simplified point pairs, {:.0}m",
        route_index,
        route.points.len(),
        route.simplified_point_pairs.len(),
        route.length()
    );
    Ok(route)
}

/// Prepare an event's routes. The first route is the main route; every other route is
/// linked onto it.
pub fn prepare_routes(options: Vec<RouteOptions>) -> Result<Vec<PreparedRoute>, RouteError> {
    #[cfg(feature = "parallel")]
    let routes: Result<Vec<PreparedRoute>, RouteError> = {
        use rayon::prelude::*;
        options
            .into_par_iter()
            .enumerate()
            .map(|(i, options)| prepare_route_at(i, options))
            .collect()
    };

    #[cfg(not(feature = "parallel"))]
    let routes: Result<Vec<PreparedRoute>, RouteError> = options
        .into_iter()
        .enumerate()
        .map(|(i, options)| prepare_route_at(i, options))
        .collect();

    let mut routes = routes?;
    if routes.is_empty() {
        return Ok(routes);
    }
    for (i, route) in routes.iter_mut().enumerate() {
        route.main = i == 0;
    }
    link_secondary_routes(&mut routes)?;
    Ok(routes)
}

fn with_distance_and_index(points: Vec<GeoPoint>) -> Vec<IndexedPoint> {
    let mut dist = 0.0;
    let mut indexed: Vec<IndexedPoint> = Vec::with_capacity(points.len());
    for (i, point) in points.into_iter().enumerate() {
        if let Some(prev) = indexed.last() {
            dist += distance(&prev.point, &point);
        }
        indexed.push(IndexedPoint::new(point, i, dist));
    }
    indexed
}

// =============================================================================
// Secondary Routes
// =============================================================================

/// Project each secondary route's ends onto `routes[0]` so its distances can be
/// reported on the main route's axis.
pub fn link_secondary_routes(routes: &mut [PreparedRoute]) -> Result<(), RouteError> {
    let (main, secondary) = routes.split_first_mut().ok_or(RouteError::NoMainRoute)?;

    for route in secondary {
        let (Some(first), Some(last)) = (route.points.first(), route.points.last()) else {
            continue;
        };
        let (start_distance, prev_point) = project_onto(main, &first.point, |pair| pair.a.index);
        let (end_distance, next_point) = project_onto(main, &last.point, |pair| pair.b.index);
        let dist_factor = (end_distance - start_distance) / last.distance;

        route.main = false;
        route.link = Some(RouteLink {
            start_distance,
            end_distance,
            dist_factor,
            prev_point,
            next_point,
        });
    }
    Ok(())
}

fn project_onto(
    main: &PreparedRoute,
    point: &GeoPoint,
    pick_index: impl Fn(&PointPairPrecalc) -> usize,
) -> (f64, usize) {
    match closest::closest_on_route(main, point, f64::INFINITY, None) {
        Some(hit) => {
            let prev = &hit.point_pair.a;
            (prev.distance + distance(&prev.point, &hit.point), pick_index(hit.point_pair))
        }
        None => (0.0, 0),
    }
}

// =============================================================================
// Ramer–Douglas–Peucker
// =============================================================================

/// Simplify a polyline, keeping points further than `epsilon` meters from the chord.
///
/// Inputs of fewer than three points are returned unchanged.
///
/// # Example
///
/// ```rust
/// use route_analyser::{GeoPoint, route::rdp};
///
/// let points = vec![
///     GeoPoint::new(0.0, 0.0),
///     GeoPoint::new(0.0001, 15.0),
///     GeoPoint::new(0.0, 30.0),
///     GeoPoint::new(15.0, 45.0),
///     GeoPoint::new(0.0, 60.0),
/// ];
/// let simplified = rdp(&points, 20.0);
/// assert_eq!(simplified.len(), 4);
/// ```
pub fn rdp<T: AsRef<GeoPoint> + Clone>(points: &[T], epsilon: f64) -> Vec<T> {
    rdp_indexes(points, epsilon)
        .into_iter()
        .map(|i| points[i].clone())
        .collect()
}

/// Indexes of the points [`rdp`] keeps.
pub fn rdp_indexes<T: AsRef<GeoPoint>>(points: &[T], epsilon: f64) -> Vec<usize> {
    if points.len() <= 2 {
        return (0..points.len()).collect();
    }

    let mut keep = vec![false; points.len()];
    keep[0] = true;
    keep[points.len() - 1] = true;

    // Explicit stack: long routes would otherwise recurse thousands deep.
    let mut stack = vec![(0, points.len() - 1)];
    while let Some((start, end)) = stack.pop() {
        if end <= start + 1 {
            continue;
        }
        let a = points[start].as_ref();
        let b = points[end].as_ref();
        let (c12, a_flat, b_flat, d_ab) = closest::precalc(a, b);

        let mut max_dist = f64::NEG_INFINITY;
        let mut max_index = start;
        for (i, point) in points.iter().enumerate().take(end).skip(start + 1) {
            let dist = closest::c_point(point.as_ref(), a, b, &c12, &a_flat, &b_flat, d_ab).dist;
            if dist > max_dist {
                max_dist = dist;
                max_index = i;
            }
        }

        if max_dist > epsilon {
            keep[max_index] = true;
            stack.push((max_index, end));
            stack.push((start, max_index));
        }
    }

    keep.iter()
        .enumerate()
        .filter_map(|(i, &k)| if k { Some(i) } else { None })
        .collect()
}

/// Simplify in sections split at points near each of `split_at_dist`.
///
/// For each split distance the anchor is the simplified point, within
/// `split_point_range` meters, whose route distance is nearest to it. Each section is
/// simplified on its own so the anchors always survive.
pub fn rdp_sections(
    points: &[IndexedPoint],
    epsilon: f64,
    split_at_dist: &[f64],
    split_point_range: f64,
) -> Vec<IndexedPoint> {
    let mut simplified = Vec::new();
    let mut last_index = 0;

    for &dist in split_at_dist {
        let min_dist = dist - split_point_range;
        let max_dist = dist + split_point_range;
        let close_points: Vec<IndexedPoint> = points
            .iter()
            .filter(|p| min_dist <= p.distance && p.distance < max_dist)
            .cloned()
            .collect();

        let anchor = rdp(&close_points, epsilon)
            .into_iter()
            .min_by(|a, b| (dist - a.distance).abs().total_cmp(&(dist - b.distance).abs()));
        let Some(anchor) = anchor else {
            warn!("No route points within {split_point_range}m of split distance {dist}m");
            continue;
        };
        if anchor.index <= last_index {
            warn!("Split distance {dist}m does not advance past point {last_index}");
            continue;
        }

        let mut section = rdp(&points[last_index..=anchor.index], epsilon);
        section.pop();
        simplified.extend(section);
        last_index = anchor.index;
    }

    simplified.extend(rdp(&points[last_index..], epsilon));
    simplified
}

// =============================================================================
// Moving Along a Route
// =============================================================================

/// The point `dist` meters along `points`.
///
/// Returns the last point when `dist` is past the end, and `None` for an empty input.
pub fn move_along_route(points: &[GeoPoint], dist: f64) -> Option<GeoPoint> {
    let mut remaining = dist;
    for pair in points.windows(2) {
        let between = distance(&pair[0], &pair[1]);
        if remaining > between {
            remaining -= between;
        } else {
            let t = if between > 0.0 { remaining / between } else { 0.0 };
            return Some(GeoPoint::from_nvec(interpolate(&pair[0].nv(), &pair[1].nv(), t)));
        }
    }
    points.last().cloned()
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

    fn circular_route_options() -> RouteOptions {
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
        options
    }

    fn rdp_sample() -> Vec<GeoPoint> {
        vec![
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(0.0001, 15.0),
            GeoPoint::new(0.0, 30.0),
            GeoPoint::new(15.0, 45.0),
            GeoPoint::new(0.0, 60.0),
        ]
    }

    #[test]
    fn test_rdp() {
        let simplified = rdp(&rdp_sample(), 20.0);
        assert_eq!(
            simplified,
            vec![
                GeoPoint::new(0.0, 0.0),
                GeoPoint::new(0.0, 30.0),
                GeoPoint::new(15.0, 45.0),
                GeoPoint::new(0.0, 60.0),
            ]
        );
    }

    #[test]
    fn test_rdp_idempotent() {
        let once = rdp(&rdp_sample(), 20.0);
        let twice = rdp(&once, 20.0);
        assert_eq!(once, twice);

        let options = circular_route_options();
        let points: Vec<GeoPoint> = options.original_points.iter().copied().map(GeoPoint::from).collect();
        let once = rdp(&points, 5_000.0);
        assert_eq!(rdp(&once, 5_000.0), once);
    }

    #[test]
    fn test_rdp_short_inputs_unchanged() {
        let empty: Vec<GeoPoint> = vec![];
        assert!(rdp(&empty, 20.0).is_empty());
        let one = vec![GeoPoint::new(1.0, 1.0)];
        assert_eq!(rdp(&one, 20.0), one);
        let two = vec![GeoPoint::new(1.0, 1.0), GeoPoint::new(1.0, 1.0001)];
        assert_eq!(rdp(&two, 1_000_000.0), two);
    }

    #[test]
    fn test_distances_non_decreasing() {
        let route = prepare_route(circular_route_options()).unwrap();
        assert_eq!(route.points[0].distance, 0.0);
        for w in route.points.windows(2) {
            assert!(w[0].distance <= w[1].distance);
        }
        for (i, p) in route.points.iter().enumerate() {
            assert_eq!(p.index, i);
        }
        assert!(approx_eq(route.length(), 166_916.356, 0.01));
    }

    #[test]
    fn test_consecutive_duplicates_dropped() {
        let route = prepare_route(RouteOptions::new(vec![
            [-26.300420, 28.049410],
            [-26.300420, 28.049410],
            [-26.315691, 28.062354],
            [-26.315691, 28.062354],
            [-26.322250, 28.042440],
        ]))
        .unwrap();
        assert_eq!(route.points.len(), 3);
        assert_eq!(route.point_pairs.len(), 2);
        assert!(approx_eq(route.length(), 4246.094, 0.01));
    }

    #[test]
    fn test_too_few_points() {
        let err = prepare_route(RouteOptions::new(vec![[1.0, 1.0], [1.0, 1.0]])).unwrap_err();
        assert!(matches!(err, RouteError::TooFewPoints { route: 0, points: 1 }));
    }

    #[test]
    fn test_detailed_simplification() {
        // The middle point is ~1m off the line between its neighbours.
        let mut options = RouteOptions::new(vec![[0.0, 0.0], [0.00001, 0.005], [0.0, 0.01]]);
        assert_eq!(prepare_route(options.clone()).unwrap().points.len(), 2);

        options.rdp_epsilon = 0.0;
        assert_eq!(prepare_route(options).unwrap().points.len(), 3);
    }

    #[test]
    fn test_simplified_tier() {
        let route = prepare_route(RouteOptions::new(vec![
            [-26.300420, 28.049410],
            [-26.315691, 28.062354],
            [-26.322250, 28.042440],
        ]))
        .unwrap();
        assert_eq!(route.simplified_points_indexes(), vec![0, 1, 2]);

        let straight = prepare_route(RouteOptions::new(vec![[0.0, 0.0], [0.0, 0.01], [0.0, 0.02], [0.0, 0.03]])).unwrap();
        assert_eq!(straight.simplified_points_indexes(), vec![0, 3]);
        assert_eq!(straight.point_pairs.len(), 3);
    }

    #[test]
    fn test_split_sections_keep_loop_shape() {
        let route = prepare_route(circular_route_options()).unwrap();
        let indexes = route.simplified_points_indexes();
        assert_eq!(indexes.first(), Some(&0));
        assert_eq!(indexes.last(), Some(&(route.points.len() - 1)));
        assert!(indexes.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(route.simplified_point_pairs.len(), 11);
    }

    #[test]
    fn test_precomputed_simplified_indexes() {
        let mut options = circular_route_options();
        options.simplified_points_indexes = Some(vec![0, 5, 11]);
        let route = prepare_route(options.clone()).unwrap();
        assert_eq!(route.simplified_points_indexes(), vec![0, 5, 11]);

        options.simplified_points_indexes = Some(vec![0, 50]);
        let err = prepare_route(options.clone()).unwrap_err();
        assert!(matches!(err, RouteError::SimplifiedIndex { index: 50, .. }));

        for indexes in [vec![5, 0], vec![0, 5, 5, 11], vec![1, 11], vec![0, 5], vec![0]] {
            options.simplified_points_indexes = Some(indexes);
            let err = prepare_route(options.clone()).unwrap_err();
            assert!(matches!(err, RouteError::SimplifiedIndexOrder { last: 11, .. }));
        }
    }

    #[test]
    fn test_secondary_route_linkage() {
        let routes = prepare_routes(vec![
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
        .unwrap();

        assert!(routes[0].main);
        assert!(routes[0].link.is_none());
        assert!(!routes[1].main);

        let link = routes[1].link.unwrap();
        assert!(approx_eq(link.start_distance, 2130.0, 0.1));
        assert!(approx_eq(link.end_distance, 9427.6, 0.1));
        assert_eq!(link.prev_point, 1);
        assert_eq!(link.next_point, 2);
        let expected_factor = (link.end_distance - link.start_distance) / routes[1].length();
        assert!(approx_eq(link.dist_factor, expected_factor, 1e-12));
        assert!(approx_eq(link.dist_factor, 0.4052, 0.0001));
    }

    #[test]
    fn test_prepare_no_routes() {
        assert!(prepare_routes(vec![]).unwrap().is_empty());
        assert!(matches!(link_secondary_routes(&mut []), Err(RouteError::NoMainRoute)));
    }

    #[test]
    fn test_route_options_from_json() {
        let options: RouteOptions = serde_json::from_str(
            r#"{"original_points": [[-26.3, 28.04], [-26.31, 28.06]], "split_at_dist": [1000]}"#,
        )
        .unwrap();
        assert_eq!(options.rdp_epsilon, 2.0);
        assert_eq!(options.split_point_range, 500.0);
        assert_eq!(options.split_at_dist, vec![1000.0]);
        assert!(options.simplified_points_indexes.is_none());
    }

    #[test]
    fn test_move_along_route() {
        let points = vec![GeoPoint::new(0.0, 0.0), GeoPoint::new(0.0, 0.01), GeoPoint::new(0.01, 0.01)];
        let first_leg = distance(&points[0], &points[1]);

        let start = move_along_route(&points, 0.0).unwrap();
        assert!(approx_eq(start.lng, 0.0, 1e-9));

        let half = move_along_route(&points, first_leg / 2.0).unwrap();
        assert!(approx_eq(half.lat, 0.0, 1e-9));
        assert!(approx_eq(half.lng, 0.005, 1e-6));

        let second = move_along_route(&points, first_leg + 10.0).unwrap();
        assert!(approx_eq(second.lng, 0.01, 1e-9));
        assert!(approx_eq(distance(&points[1], &second), 10.0, 0.01));

        assert_eq!(move_along_route(&points, 1e9), Some(points[2].clone()));
        assert!(move_along_route(&[], 10.0).is_none());
    }
}
