//! Analyse a short ride over a main route with an alternate section.
//!
//! Run with: cargo run --example analyse_static

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use route_analyser::{
    prepare_routes, AnalyseConfig, AnalyseTracker, Fix, Position, RouteOptions, Tracker,
};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Main route, then an alternate that leaves and rejoins it
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
    .expect("valid routes");

    for (i, route) in routes.iter().enumerate() {
        println!(
            "Route {}: {} points, {} simplified pairs, {:.0}m{}",
            i,
            route.points.len(),
            route.simplified_point_pairs.len(),
            route.length(),
            route
                .link
                .map(|link| format!(", joins main at {:.0}m", link.start_distance))
                .unwrap_or_default()
        );
    }

    let start = Utc.with_ymd_and_hms(2017, 1, 1, 5, 0, 0).unwrap();
    let source = Tracker::new("rider-1");
    source.new_points(vec![
        Fix::with_position(start, Position::with_elevation(-26.300824, 28.050185, 1800.0)),
        Fix::with_position(
            start + chrono::Duration::minutes(1),
            Position::with_elevation(-26.325051, 27.985600, 1800.0),
        ),
        Fix::with_position(
            start + chrono::Duration::minutes(2),
            Position::with_elevation(-26.417149, 28.073087, 1800.0),
        ),
    ]);
    source.finish(Ok(()));

    let config = AnalyseConfig {
        analyse_start_time: Some(start),
        ..AnalyseConfig::default()
    };
    let analysed = AnalyseTracker::start(source, Arc::new(routes), None, config);
    analysed.complete().await.expect("source completes");

    println!("\nAnalysed fixes:");
    for fix in analysed.points() {
        println!("  {}", serde_json::to_string(&fix).expect("fix serializes"));
    }
}
