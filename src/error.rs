//! Error types.
//!
//! Only setup paths (route preparation, opening the cache) and the tracker
//! completion surface errors. Numeric drift, off-segment projections and
//! off-route fixes are handled where they occur and never show up here.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("Route {route} has {points} distinct points, at least 2 are needed")]
    TooFewPoints { route: usize, points: usize },

    #[error("No main route to link secondary routes to")]
    NoMainRoute,

    #[error("Simplified point index {index} is out of range for route {route} ({len} points)")]
    SimplifiedIndex { route: usize, index: usize, len: usize },

    #[error("Simplified point indexes of route {route} must increase from 0 to {last}")]
    SimplifiedIndexOrder { route: usize, last: usize },
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Cache record of {0} bytes is too large")]
    RecordTooLarge(usize),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("Tracker was stopped")]
    Stopped,

    #[error("Source error: {0}")]
    Source(String),
}
