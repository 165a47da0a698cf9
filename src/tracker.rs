//! # Trackers
//!
//! A [`Tracker`] is a growing, ordered list of [`Fix`]es plus the plumbing to observe it:
//! subscribers get every later batch in append order, and a completion signal fires once
//! the tracker has no more data. Raw sources feed one; the analyser consumes one and
//! exposes another.
//!
//! ```rust
//! use route_analyser::{Fix, Tracker};
//! use chrono::{TimeZone, Utc};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let tracker = Tracker::new("rider");
//! let (existing, mut subscription) = tracker.subscribe();
//! assert!(existing.is_empty());
//!
//! tracker.new_points(vec![Fix::new(Utc.with_ymd_and_hms(2017, 1, 1, 5, 0, 0).unwrap())]);
//! tracker.finish(Ok(()));
//!
//! assert_eq!(subscription.recv().await.map(|batch| batch.len()), Some(1));
//! assert!(subscription.recv().await.is_none());
//! assert_eq!(tracker.completed().await, Ok(()));
//! # }
//! ```

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::error::TrackerError;
use crate::GeoPoint;

// ============================================================================
// Fixes
// ============================================================================

/// Activity status of a rider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Active,
    Inactive,
    Finished,
}

/// A GPS position, serialized as `[lat, lng]` or `[lat, lng, elevation]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
    pub elevation: Option<f64>,
}

impl Position {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng, elevation: None }
    }

    pub fn with_elevation(lat: f64, lng: f64, elevation: f64) -> Self {
        Self { lat, lng, elevation: Some(elevation) }
    }

    pub fn geo_point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lng)
    }
}

impl TryFrom<Vec<f64>> for Position {
    type Error = String;

    fn try_from(values: Vec<f64>) -> Result<Self, Self::Error> {
        match values[..] {
            [lat, lng] => Ok(Self::new(lat, lng)),
            [lat, lng, elevation] => Ok(Self::with_elevation(lat, lng, elevation)),
            _ => Err(format!("position needs 2 or 3 values, got {}", values.len())),
        }
    }
}

impl From<Position> for Vec<f64> {
    fn from(position: Position) -> Self {
        match position.elevation {
            Some(elevation) => vec![position.lat, position.lng, elevation],
            None => vec![position.lat, position.lng],
        }
    }
}

/// A timestamped fix, with the annotations the analyser adds.
///
/// Keys this type doesn't know about are kept in `extra` and written back out unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dist_route: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dist_from_last: Option<i64>,
    /// km/h, one decimal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_from_last: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dist_ridden: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rider_status: Option<Status>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Fix {
    /// A fix with only a time.
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time,
            position: None,
            track_id: None,
            dist_route: None,
            dist_from_last: None,
            speed_from_last: None,
            dist_ridden: None,
            status: None,
            finished_time: None,
            rider_status: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_position(time: DateTime<Utc>, position: Position) -> Self {
        Self { position: Some(position), ..Self::new(time) }
    }

    /// A status-only fix.
    pub fn status(time: DateTime<Utc>, status: Status) -> Self {
        Self { status: Some(status), ..Self::new(time) }
    }
}

// ============================================================================
// Tracker
// ============================================================================

type Completion = Option<Result<(), TrackerError>>;
type StopHandler = Box<dyn FnOnce() + Send>;

struct TrackerState {
    points: Vec<Fix>,
    subscribers: Vec<mpsc::UnboundedSender<Vec<Fix>>>,
    stop_handler: Option<StopHandler>,
}

struct TrackerInner {
    name: String,
    state: Mutex<TrackerState>,
    completion: watch::Sender<Completion>,
}

/// Shared handle to a tracker. Clones observe and feed the same tracker.
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<TrackerInner>,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("name", &self.inner.name)
            .field("points", &self.state().points.len())
            .field("completion", &*self.inner.completion.borrow())
            .finish()
    }
}

impl Tracker {
    pub fn new(name: impl Into<String>) -> Self {
        let (completion, _) = watch::channel(None);
        Self {
            inner: Arc::new(TrackerInner {
                name: name.into(),
                state: Mutex::new(TrackerState {
                    points: Vec::new(),
                    subscribers: Vec::new(),
                    stop_handler: None,
                }),
                completion,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        // Points are only ever appended, so state behind a poisoned lock is still usable.
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of every point so far.
    pub fn points(&self) -> Vec<Fix> {
        self.state().points.clone()
    }

    pub fn len(&self) -> usize {
        self.state().points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().points.is_empty()
    }

    /// Append a batch and deliver it to every subscriber.
    ///
    /// Batches added after the tracker finished are dropped.
    pub fn new_points(&self, points: Vec<Fix>) {
        if points.is_empty() {
            return;
        }
        let mut state = self.state();
        if self.is_finished() {
            warn!("{}: dropping {} points added after completion", self.inner.name, points.len());
            return;
        }
        debug!("{}: {} new points", self.inner.name, points.len());
        state.subscribers.retain(|subscriber| subscriber.send(points.clone()).is_ok());
        state.points.extend(points);
    }

    /// The points so far, and a subscription to every later batch.
    pub fn subscribe(&self) -> (Vec<Fix>, Subscription) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.state();
        if !self.is_finished() {
            state.subscribers.push(sender);
        }
        (state.points.clone(), Subscription { receiver })
    }

    /// Run `handler` when the tracker is stopped.
    pub fn set_stop_handler(&self, handler: impl FnOnce() + Send + 'static) {
        self.state().stop_handler = Some(Box::new(handler));
    }

    /// Halt acquisition. Completes the tracker with [`TrackerError::Stopped`] unless it
    /// has already completed.
    pub fn stop(&self) {
        let handler = self.state().stop_handler.take();
        if let Some(handler) = handler {
            handler();
        }
        self.finish(Err(TrackerError::Stopped));
    }

    /// Mark the tracker complete. Only the first call has any effect. Subscriptions end
    /// once they have delivered every batch.
    pub fn finish(&self, result: Result<(), TrackerError>) {
        let mut state = self.state();
        let finished = self.inner.completion.send_if_modified(|completion| {
            if completion.is_some() {
                return false;
            }
            *completion = Some(result);
            true
        });
        if finished {
            state.subscribers.clear();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.inner.completion.borrow().is_some()
    }

    /// Wait for the tracker to complete.
    pub async fn completed(&self) -> Result<(), TrackerError> {
        let mut receiver = self.inner.completion.subscribe();
        let completion = receiver
            .wait_for(Option::is_some)
            .await
            .map_err(|_| TrackerError::Source("completion channel closed".to_string()))?;
        completion.clone().unwrap_or(Ok(()))
    }
}

/// Batches appended to a tracker after [`Tracker::subscribe`], in order.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Vec<Fix>>,
}

impl Subscription {
    /// Next batch, or `None` once the tracker has finished and every batch was delivered.
    pub async fn recv(&mut self) -> Option<Vec<Fix>> {
        self.receiver.recv().await
    }
}

impl futures::Stream for Subscription {
    type Item = Vec<Fix>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

// ============================================================================
// Tests
// ============================================================================
