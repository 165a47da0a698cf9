//! # Rider Analysis
//!
//! [`AnalyseTracker`] turns a rider's raw fixes into annotated fixes:
//!
//! | Annotation | Meaning |
//! |------------|---------|
//! | `dist_route` | Route distance of the fix, on the main route's axis |
//! | `track_id` | Track segment, bumped after a long and far gap |
//! | `dist_from_last` | Meters from the previous positioned fix |
//! | `speed_from_last` | km/h from the previous positioned fix |
//! | `dist_ridden` | Running total of `dist_from_last` |
//! | `status` | `Active` / `Inactive`, only when it changes |
//! | `finished_time`, `rider_status` | On the fix where the finish is reached |
//!
//! Once a rider goes quiet for `track_break_time` a status-only `Inactive` fix is
//! emitted, timed at the last fix plus `track_break_time`. A newer fix cancels it.
//!
//! A rider whose last fix is close to the finish and still moving is given an estimated
//! finish once they should have arrived. Stretches ridden away from the routes (or
//! backwards along them) are collected on a separate off-route tracker.
//!
//! ```rust
//! use std::sync::Arc;
//! use chrono::{TimeZone, Utc};
//! use route_analyser::{AnalyseConfig, AnalyseTracker, Fix, Position, Tracker};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let source = Tracker::new("rider");
//! source.new_points(vec![Fix::with_position(
//!     Utc.with_ymd_and_hms(2017, 1, 1, 5, 0, 0).unwrap(),
//!     Position::new(-26.300822, 28.049444),
//! )]);
//! source.finish(Ok(()));
//!
//! let analysed = AnalyseTracker::start(source, Arc::new(vec![]), None, AnalyseConfig::default());
//! analysed.complete().await.unwrap();
//! assert_eq!(analysed.points()[0].track_id, Some(0));
//! # }
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use crate::cache::ClosestCache;
use crate::closest::{ClosestPointPairHit, closest_on_routes, route_distance};
use crate::error::TrackerError;
use crate::geo_utils::{distance, polyline_length};
use crate::route::{PreparedRoute, move_along_route};
use crate::tracker::{Fix, Position, Status, Subscription, Tracker};
use crate::GeoPoint;

/// Minimum speed (km/h) for a position to be extrapolated.
const MIN_PREDICT_SPEED: f64 = 3.0;

/// Fixes between progress checks on long batches.
const PROGRESS_EVERY: usize = 10;

// ============================================================================
// Configuration
// ============================================================================

/// Analyser settings.
#[derive(Debug, Clone)]
pub struct AnalyseConfig {
    /// Fixes before this pass through unmodified. `None` disables route matching.
    pub analyse_start_time: Option<DateTime<Utc>>,
    /// Gap in time after which a rider is inactive
    pub track_break_time: Duration,
    /// Gap in distance (meters) that, with `track_break_time`, starts a new track
    pub track_break_dist: f64,
    /// Refine a simplified hit when it is at most this far away (meters)
    pub min_complex_dist: f64,
    /// Accept a hit on the main or previous route when closer than this (meters)
    pub break_out_dist: f64,
    /// Hits further than this (meters) are treated as off route
    pub off_route_dist: f64,
    /// A main-route distance this close (meters) to the route end is a finish
    pub finish_dist: f64,
    /// Estimate a finish when a batch ends this close (meters) to the route end
    pub est_finish_dist: f64,
    /// How long after the estimated finish time to wait for a real finish
    pub est_finish_wait: Duration,
    /// Emit partial results of a long batch after this much processing time
    pub submit_after: Duration,
}

impl Default for AnalyseConfig {
    fn default() -> Self {
        Self {
            analyse_start_time: None,
            track_break_time: Duration::minutes(20),
            track_break_dist: 10_000.0,
            min_complex_dist: 1_000.0,
            break_out_dist: 250.0,
            off_route_dist: 5_000.0,
            finish_dist: 100.0,
            est_finish_dist: 2_000.0,
            est_finish_wait: Duration::minutes(5),
            submit_after: Duration::seconds(5),
        }
    }
}

// ============================================================================
// State
// ============================================================================

/// An owned copy of the parts of a hit the analyser keeps between fixes.
#[derive(Debug, Clone)]
struct RouteHit {
    route_index: usize,
    pair_a_index: usize,
    dist: f64,
    point: GeoPoint,
    route_dist: f64,
}

impl From<ClosestPointPairHit<'_>> for RouteHit {
    fn from(hit: ClosestPointPairHit<'_>) -> Self {
        Self {
            route_index: hit.route_index,
            pair_a_index: hit.point_pair.a.index,
            dist: hit.dist,
            route_dist: route_distance(&hit),
            point: hit.point,
        }
    }
}

#[derive(Debug)]
struct AnalyserState {
    prev_fix: Option<Fix>,
    prev_hit: Option<RouteHit>,
    prev_route_dist: Option<f64>,
    going_forward: Option<bool>,
    dist_ridden: f64,
    track_id: u64,
    off_route_track_id: u64,
    is_off_route: bool,
    status: Option<Status>,
    finished: bool,
    stopped: bool,
    inactive_timer: Option<JoinHandle<()>>,
    est_finish_timer: Option<JoinHandle<()>>,
}

impl Default for AnalyserState {
    fn default() -> Self {
        Self {
            prev_fix: None,
            prev_hit: None,
            prev_route_dist: Some(0.0),
            going_forward: None,
            dist_ridden: 0.0,
            track_id: 0,
            off_route_track_id: 0,
            is_off_route: false,
            status: None,
            finished: false,
            stopped: false,
            inactive_timer: None,
            est_finish_timer: None,
        }
    }
}

impl AnalyserState {
    fn set_status(&mut self, status: Status) -> Option<Status> {
        if self.status == Some(status) {
            None
        } else {
            self.status = Some(status);
            Some(status)
        }
    }

    fn take_timers(&mut self) -> impl Iterator<Item = JoinHandle<()>> {
        [self.inactive_timer.take(), self.est_finish_timer.take()].into_iter().flatten()
    }
}

fn off_route_fix(time: DateTime<Utc>, position: Position, track_id: u64) -> Fix {
    let mut fix = Fix::with_position(time, position);
    fix.track_id = Some(track_id);
    fix
}

/// Where a rider is expected to be.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictedPosition {
    pub position: Position,
    pub dist_route: Option<i64>,
}

// ============================================================================
// Analyser
// ============================================================================

struct Analyser {
    routes: Arc<Vec<PreparedRoute>>,
    cache: Option<Arc<Mutex<ClosestCache>>>,
    config: AnalyseConfig,
    state: tokio::sync::Mutex<AnalyserState>,
    output: Tracker,
    off_route: Tracker,
}

impl Analyser {
    async fn run(self: Arc<Self>, source: Tracker, existing: Vec<Fix>, mut subscription: Subscription) {
        self.process_batch(existing).await;
        while let Some(batch) = subscription.recv().await {
            self.process_batch(batch).await;
        }

        let result = source.completed().await;
        let (timers, stopped) = {
            let mut state = self.state.lock().await;
            (state.take_timers().collect::<Vec<_>>(), state.stopped)
        };
        for timer in timers {
            if stopped {
                cancel_timer(timer).await;
            } else {
                join_timer(timer).await;
            }
        }

        match &result {
            Ok(()) | Err(TrackerError::Stopped) => {}
            Err(e) => error!("{}: {e}", self.output.name()),
        }
        self.off_route.finish(result.clone());
        self.output.finish(result);
    }

    /// The route hit for a fix, `None` when off route.
    ///
    /// After a long gap a rider can be far along the route from their previous route
    /// distance, which ranks their real position behind segments near the old one. When
    /// that leaves no hit in range the search is repeated without the previous distance.
    fn route_hit(&self, point: &GeoPoint, prev_route_index: Option<usize>, prev_dist: Option<f64>) -> Option<RouteHit> {
        let off_route_dist = self.config.off_route_dist;
        let in_range = |hit: &RouteHit| hit.dist <= off_route_dist;
        match self.closest(point, prev_route_index, prev_dist).filter(in_range) {
            Some(hit) => Some(hit),
            None if prev_dist.is_some() && !self.routes.is_empty() => {
                self.closest(point, prev_route_index, None).filter(in_range)
            }
            None => None,
        }
    }

    fn closest(&self, to_point: &GeoPoint, prev_route_index: Option<usize>, prev_dist: Option<f64>) -> Option<RouteHit> {
        let config = &self.config;
        if let Some(cache) = &self.cache {
            match cache.lock() {
                Ok(mut cache) => {
                    return cache
                        .closest_on_routes(
                            &self.routes,
                            to_point,
                            config.min_complex_dist,
                            prev_route_index,
                            config.break_out_dist,
                            prev_dist,
                        )
                        .map(RouteHit::from);
                }
                Err(_) => warn!("{}: closest cache lock poisoned, searching directly", self.output.name()),
            }
        }
        closest_on_routes(
            &self.routes,
            to_point,
            config.min_complex_dist,
            prev_route_index,
            config.break_out_dist,
            prev_dist,
        )
        .map(RouteHit::from)
    }

    async fn process_batch(self: &Arc<Self>, batch: Vec<Fix>) {
        if batch.is_empty() {
            return;
        }
        let name = self.output.name();
        debug!("{name}: analysing {} points", batch.len());

        let config = &self.config;
        let route_end = self.routes.first().and_then(|route| route.points.last()).map(|p| p.distance);
        let batch_len = batch.len();
        let started = Instant::now();
        let mut log_i = 0;
        let mut log_time = started;
        let mut out: Vec<Fix> = Vec::with_capacity(batch_len + 1);
        let mut off_route_out: Vec<Fix> = Vec::new();
        let mut est_finish = None;

        let mut state = self.state.lock().await;
        for (i, mut fix) in batch.into_iter().enumerate() {
            let Some(position) = fix.position else {
                out.push(fix);
                continue;
            };
            let pre_start = config.analyse_start_time.is_some_and(|start| fix.time < start);
            if state.finished || pre_start {
                out.push(fix);
                continue;
            }
            if !(position.lat.is_finite() && position.lng.is_finite()) {
                warn!("{name}: skipping fix at {} with invalid position {position:?}", fix.time);
                continue;
            }

            for timer in state.take_timers() {
                cancel_timer(timer).await;
            }

            let point = position.geo_point();

            // Some(on route) when route matching, with the main route distance of a main route hit
            let mut on_route = None;
            let mut main_route_dist = None;
            if config.analyse_start_time.is_some() {
                let prev_route_index = state.prev_hit.as_ref().map(|hit| hit.route_index);
                let prev_route_dist = state.prev_route_dist;
                let hit = match catch_unwind(AssertUnwindSafe(|| {
                    self.route_hit(&point, prev_route_index, prev_route_dist)
                })) {
                    Ok(hit) => hit,
                    Err(_) => {
                        error!("{name}: route matching failed, skipping fix at {}", fix.time);
                        continue;
                    }
                };

                match &hit {
                    Some(hit) => {
                        fix.dist_route = Some(hit.route_dist as i64);
                        let going_forward =
                            state.prev_route_dist.map_or(true, |prev| prev == 0.0 || hit.route_dist > prev);
                        state.going_forward = Some(going_forward);
                        state.prev_route_dist = Some(hit.route_dist);

                        if hit.route_index == 0 {
                            main_route_dist = Some(hit.route_dist);
                        }
                        let at_finish = route_end.is_some_and(|end| (hit.route_dist - end).abs() < config.finish_dist);
                        if hit.route_index == 0 && at_finish {
                            debug!("{name}: finished at {}", fix.time);
                            state.finished = true;
                            fix.finished_time = Some(fix.time);
                            fix.rider_status = Some(Status::Finished);
                        }
                    }
                    None => state.going_forward = None,
                }
                if !self.routes.is_empty() {
                    on_route = Some(hit.as_ref().is_some_and(|hit| hit.dist < config.break_out_dist));
                }
                state.prev_hit = hit;
            }

            let mut speed = None;
            let prev = state.prev_fix.as_ref().map(|prev| (prev.time, prev.position));
            if let Some((prev_time, prev_position)) = prev {
                let dist = prev_position.map_or(0.0, |p| distance(&p.geo_point(), &point));
                let elapsed = fix.time - prev_time;

                if elapsed > config.track_break_time && dist > config.track_break_dist {
                    state.track_id += 1;
                    state.off_route_track_id += 1;
                    if let Some(status) = state.set_status(Status::Inactive) {
                        out.push(Fix::status(prev_time + config.track_break_time, status));
                    }
                }

                fix.dist_from_last = Some(dist.round() as i64);
                let seconds = elapsed.num_milliseconds() as f64 / 1000.0;
                if seconds > 0.0 {
                    speed = Some(dist / seconds);
                    fix.speed_from_last = Some((dist / seconds * 3.6 * 10.0).round() / 10.0);
                }
                state.dist_ridden += dist;
                fix.dist_ridden = Some(state.dist_ridden.round() as i64);
            }

            if let Some(on_route) = on_route {
                let backwards = state.going_forward == Some(false)
                    && fix.speed_from_last.is_some_and(|speed| speed > MIN_PREDICT_SPEED);
                if !on_route || backwards {
                    if !state.is_off_route {
                        // The off-route stretch starts at the last fix on this track
                        let track_id = state.track_id;
                        if let Some(prev) = state.prev_fix.as_ref().filter(|prev| prev.track_id == Some(track_id)) {
                            if let Some(prev_position) = prev.position {
                                off_route_out.push(off_route_fix(prev.time, prev_position, state.off_route_track_id));
                            }
                        }
                    }
                    state.is_off_route = true;
                    off_route_out.push(off_route_fix(fix.time, position, state.off_route_track_id));
                } else if state.is_off_route {
                    off_route_out.push(off_route_fix(fix.time, position, state.off_route_track_id));
                    state.is_off_route = false;
                    state.off_route_track_id += 1;
                }
            }

            if i == batch_len - 1 && !state.finished {
                let to_go = main_route_dist.zip(route_end).map(|(dist, end)| (end - dist).abs());
                if let (Some(to_go), Some(speed)) = (to_go.filter(|&d| d < config.est_finish_dist), speed.filter(|&s| s > 0.0)) {
                    est_finish = Some(fix.time + Duration::milliseconds((to_go / speed * 1000.0) as i64));
                }
            }

            fix.track_id = Some(state.track_id);
            fix.status = state.set_status(Status::Active);
            state.prev_fix = Some(fix.clone());
            out.push(fix);

            if i % PROGRESS_EVERY == PROGRESS_EVERY - 1 && i + 1 < batch_len {
                let since_log = log_time.elapsed();
                if config.submit_after.to_std().is_ok_and(|submit_after| started.elapsed() >= submit_after) {
                    let rate = (i - log_i) as f64 / since_log.as_secs_f64().max(f64::EPSILON);
                    info!(
                        "{name}: {}/{} ({:.1}%) points analysed at {:.2} points/second",
                        i + 1,
                        batch_len,
                        (i + 1) as f64 / batch_len as f64 * 100.0,
                        rate
                    );
                    log_i = i;
                    log_time = Instant::now();
                    self.output.new_points(std::mem::take(&mut out));
                    self.off_route.new_points(std::mem::take(&mut off_route_out));
                    tokio::task::yield_now().await;
                }
            }
        }

        self.output.new_points(out);
        self.off_route.new_points(off_route_out);
        if !state.stopped {
            let last_time = state.prev_fix.as_ref().map(|fix| fix.time);
            if let Some(last_time) = last_time.filter(|_| state.inactive_timer.is_none()) {
                state.inactive_timer = Some(self.schedule_inactive(last_time));
            }
            if let Some(est_finish) = est_finish {
                debug!("{name}: estimated finish at {est_finish}");
                state.est_finish_timer = Some(self.schedule_est_finish(est_finish));
            }
        }
        drop(state);
        tokio::task::yield_now().await;
    }

    /// Emit `Inactive` at `last_time + track_break_time` unless a newer fix arrives first.
    fn schedule_inactive(self: &Arc<Self>, last_time: DateTime<Utc>) -> JoinHandle<()> {
        let analyser = Arc::clone(self);
        let inactive_time = last_time + self.config.track_break_time;
        let delay = (inactive_time - Utc::now()).to_std().unwrap_or_default();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = analyser.state.lock().await;
            let still_last = state.prev_fix.as_ref().is_some_and(|fix| fix.time == last_time);
            if still_last && !state.stopped {
                if let Some(status) = state.set_status(Status::Inactive) {
                    debug!("{}: inactive since {last_time}", analyser.output.name());
                    analyser.output.new_points(vec![Fix::status(inactive_time, status)]);
                }
            }
        })
    }

    /// Finish the rider at `finish_time` unless a newer fix arrives within
    /// `est_finish_wait` of it.
    fn schedule_est_finish(self: &Arc<Self>, finish_time: DateTime<Utc>) -> JoinHandle<()> {
        let analyser = Arc::clone(self);
        let delay = (finish_time + self.config.est_finish_wait - Utc::now()).to_std().unwrap_or_default();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = analyser.state.lock().await;
            if state.finished || state.stopped {
                return;
            }
            info!("{}: no finish seen, estimated finish at {finish_time}", analyser.output.name());
            state.finished = true;
            let mut fix = Fix::new(finish_time);
            fix.finished_time = Some(finish_time);
            fix.rider_status = Some(Status::Finished);
            analyser.output.new_points(vec![fix]);
        })
    }

    async fn predicted_position(&self, time: DateTime<Utc>) -> Option<PredictedPosition> {
        let state = self.state.lock().await;
        let prev = state.prev_fix.as_ref()?;
        let position = prev.position?;
        let echo = PredictedPosition { position, dist_route: prev.dist_route };

        let elapsed = time - prev.time;
        if elapsed < Duration::zero() || elapsed > self.config.track_break_time {
            return Some(echo);
        }
        let Some(speed) = prev.speed_from_last.filter(|&speed| speed > MIN_PREDICT_SPEED) else {
            return Some(echo);
        };
        let Some(hit) = state.prev_hit.as_ref().filter(|hit| hit.dist < self.config.break_out_dist) else {
            return Some(echo);
        };
        if state.going_forward != Some(true) {
            return Some(echo);
        }
        let Some(route) = self.routes.get(hit.route_index) else {
            return Some(echo);
        };

        let ahead: Vec<GeoPoint> = std::iter::once(hit.point.clone())
            .chain(route.points.iter().skip(hit.pair_a_index + 1).map(|p| p.point.clone()))
            .collect();
        let travelled = (speed / 3.6 * elapsed.num_milliseconds() as f64 / 1000.0).min(polyline_length(&ahead));
        let predicted = move_along_route(&ahead, travelled)?;

        let factor = route.link.as_ref().filter(|_| !route.main).map_or(1.0, |link| link.dist_factor);
        Some(PredictedPosition {
            position: Position::new(predicted.lat, predicted.lng),
            dist_route: Some((hit.route_dist + travelled * factor).round() as i64),
        })
    }
}

async fn join_timer(timer: JoinHandle<()>) {
    if let Err(e) = timer.await {
        if !e.is_cancelled() {
            error!("Inactivity timer failed: {e}");
        }
    }
}

async fn cancel_timer(timer: JoinHandle<()>) {
    timer.abort();
    join_timer(timer).await;
}

// ============================================================================
// Public Handle
// ============================================================================

/// Annotated view of a source tracker, for one rider.
///
/// Must be started from within a tokio runtime.
pub struct AnalyseTracker {
    analyser: Arc<Analyser>,
    source: Tracker,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AnalyseTracker {
    /// Start analysing `source`. Points already in `source` are analysed first.
    ///
    /// `routes` are shared by every rider of an event, as is `cache`.
    pub fn start(
        source: Tracker,
        routes: Arc<Vec<PreparedRoute>>,
        cache: Option<Arc<Mutex<ClosestCache>>>,
        config: AnalyseConfig,
    ) -> Self {
        let analyser = Arc::new(Analyser {
            routes,
            cache,
            config,
            state: tokio::sync::Mutex::new(AnalyserState::default()),
            output: Tracker::new(format!("analysed.{}", source.name())),
            off_route: Tracker::new(format!("offroute.{}", source.name())),
        });

        let (existing, subscription) = source.subscribe();
        let task = tokio::spawn(Arc::clone(&analyser).run(source.clone(), existing, subscription));

        Self {
            analyser,
            source,
            task: Mutex::new(Some(task)),
        }
    }

    /// The annotated output.
    pub fn tracker(&self) -> &Tracker {
        &self.analyser.output
    }

    pub fn points(&self) -> Vec<Fix> {
        self.analyser.output.points()
    }

    /// Off-route stretches: positions with an off-route `track_id`, starting at the last
    /// fix before the rider left the route and ending at the first one back on it.
    pub fn off_route_tracker(&self) -> &Tracker {
        &self.analyser.off_route
    }

    /// Stop the source and cancel pending timers.
    pub async fn stop(&self) {
        self.analyser.state.lock().await.stopped = true;
        self.source.stop();
        let timers: Vec<JoinHandle<()>> = self.analyser.state.lock().await.take_timers().collect();
        for timer in timers {
            cancel_timer(timer).await;
        }
    }

    /// Wait for the source, every queued batch and any pending timers.
    ///
    /// Returns the source's completion result.
    pub async fn complete(&self) -> Result<(), TrackerError> {
        let task = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("{}: analysis task failed: {e}", self.analyser.output.name());
                let result = Err(TrackerError::Source(e.to_string()));
                self.analyser.off_route.finish(result.clone());
                self.analyser.output.finish(result);
            }
        }
        self.analyser.output.completed().await
    }

    /// Where the rider is expected to be at `time`.
    ///
    /// The last position is moved along its route when the rider was recently seen,
    /// moving forward on a route at speed. Otherwise the last position is returned as is.
    /// `None` until a positioned fix has been analysed.
    pub async fn predicted_position(&self, time: DateTime<Utc>) -> Option<PredictedPosition> {
        self.analyser.predicted_position(time).await
    }
}

// ============================================================================
// Tests
// ============================================================================
