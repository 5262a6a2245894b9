//! Rolling-window statistics
//!
//! A [`StatsWindow`] keeps `bucket_num` [`Bucket`]s and always records into the
//! newest one. Two background tasks drive it:
//! - rotation every `bucket_span`, dropping the oldest bucket
//! - snapshot emission every `stat_interval`, with latency percentiles
//!
//! Every recorded outcome publishes [`StatsEvent::Update`] synchronously. Updates
//! only re-sum the counters and carry the percentiles of the previous full
//! snapshot, so the hot path never sorts latency samples.

use crate::bucket::Bucket;
use crate::errors::BrakesError;
use crate::events::{Listeners, Subscription};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Latency fractions reported in every full snapshot
pub const PERCENTILES: [f64; 9] = [0.0, 0.25, 0.5, 0.75, 0.9, 0.95, 0.99, 0.995, 1.0];

/// Latency (ms) at each of the [`PERCENTILES`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    #[serde(rename = "0")]
    pub p0: u64,
    #[serde(rename = "0.25")]
    pub p25: u64,
    #[serde(rename = "0.5")]
    pub p50: u64,
    #[serde(rename = "0.75")]
    pub p75: u64,
    #[serde(rename = "0.9")]
    pub p90: u64,
    #[serde(rename = "0.95")]
    pub p95: u64,
    #[serde(rename = "0.99")]
    pub p99: u64,
    #[serde(rename = "0.995")]
    pub p995: u64,
    #[serde(rename = "1")]
    pub p100: u64,
}

impl LatencyPercentiles {
    /// Compute all percentiles from samples sorted ascending
    pub fn from_sorted(samples: &[u64]) -> Self {
        let [p0, p25, p50, p75, p90, p95, p99, p995, p100] =
            PERCENTILES.map(|p| percentile(p, samples));
        Self {
            p0,
            p25,
            p50,
            p75,
            p90,
            p95,
            p99,
            p995,
            p100,
        }
    }

    /// `(fraction, latency)` pairs in ascending order
    pub fn values(&self) -> [(f64, u64); 9] {
        let latencies = [
            self.p0, self.p25, self.p50, self.p75, self.p90, self.p95, self.p99, self.p995,
            self.p100,
        ];
        std::array::from_fn(|i| (PERCENTILES[i], latencies[i]))
    }
}

/// Aggregate of every bucket in the window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub short_circuited: u64,
    pub latency_mean: u64,
    pub percentiles: LatencyPercentiles,
}

impl Totals {
    /// `successful / total`, or 1.0 when nothing was recorded
    pub fn success_ratio(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.successful as f64 / self.total as f64
    }
}

/// Snapshot published by a breaker for monitoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub name: String,
    pub group: String,
    /// Milliseconds since the Unix epoch
    pub time: u64,
    pub open: bool,
    pub circuit_duration: u64,
    pub threshold: f64,
    pub wait_threshold: u64,
    pub stats: Totals,
}

/// Notifications published by a [`StatsWindow`]
#[derive(Debug, Clone, PartialEq)]
pub enum StatsEvent {
    /// Counters changed; percentiles are those of the last snapshot
    Update(Totals),
    /// Full aggregate including freshly computed percentiles
    Snapshot(Totals),
}

/// Sample at fraction `p` of an ascending list, 0 when empty
pub fn percentile(p: f64, sorted: &[u64]) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    if p <= 0.0 {
        return sorted[0];
    }
    let idx = (p * sorted.len() as f64).ceil() as usize;
    sorted[idx.clamp(1, sorted.len()) - 1]
}

/// Arithmetic mean rounded to the nearest integer, 0 when empty
pub fn mean(samples: &[u64]) -> u64 {
    if samples.is_empty() {
        return 0;
    }
    let sum: u64 = samples.iter().sum();
    (sum as f64 / samples.len() as f64).round() as u64
}

#[derive(Debug)]
struct WindowState {
    buckets: VecDeque<Bucket>,
    totals: Totals,
}

impl WindowState {
    fn active(&mut self) -> &mut Bucket {
        if self.buckets.is_empty() {
            self.buckets.push_back(Bucket::new());
        }
        let last = self.buckets.len() - 1;
        &mut self.buckets[last]
    }

    fn shift_and_push(&mut self) {
        self.buckets.push_back(Bucket::new());
        self.buckets.pop_front();
    }

    fn aggregate(&mut self, include_latency: bool) -> Totals {
        let mut totals = Totals::default();
        for bucket in &self.buckets {
            totals.total += bucket.total;
            totals.successful += bucket.successful;
            totals.failed += bucket.failed;
            totals.timed_out += bucket.timed_out;
            totals.short_circuited += bucket.short_circuited;
        }

        if include_latency {
            let mut samples: Vec<u64> = self
                .buckets
                .iter()
                .flat_map(|bucket| bucket.request_times.iter().copied())
                .collect();
            samples.sort_unstable();
            totals.latency_mean = mean(&samples);
            totals.percentiles = LatencyPercentiles::from_sorted(&samples);
        } else {
            totals.latency_mean = self.totals.latency_mean;
            totals.percentiles = self.totals.percentiles;
        }

        self.totals = totals.clone();
        totals
    }
}

/// Fixed-length ring of buckets with periodic rotation and snapshots
pub struct StatsWindow {
    bucket_span: Duration,
    bucket_num: usize,
    stat_interval: Duration,
    state: Mutex<WindowState>,
    listeners: Listeners<StatsEvent>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl StatsWindow {
    /// Create a window of `bucket_num` empty buckets (at least one)
    ///
    /// Timers are not running until [`start`](Self::start) is called.
    pub fn new(bucket_span: Duration, bucket_num: usize, stat_interval: Duration) -> Self {
        let bucket_num = bucket_num.max(1);
        let buckets = (0..bucket_num).map(|_| Bucket::new()).collect();
        let mut state = WindowState {
            buckets,
            totals: Totals::default(),
        };
        state.aggregate(true);

        Self {
            bucket_span,
            bucket_num,
            stat_interval,
            state: Mutex::new(state),
            listeners: Listeners::new(),
            timers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the rotation and snapshot tasks on the current tokio runtime
    ///
    /// Tasks hold a weak reference and exit once the window is dropped.
    /// Calling `start` on a running window is a no-op.
    pub fn start(self: &Arc<Self>) -> Result<(), BrakesError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            BrakesError::Configuration(
                "statistics timers require a running tokio runtime".to_string(),
            )
        })?;
        if self.bucket_span.is_zero() || self.stat_interval.is_zero() {
            return Err(BrakesError::Configuration(
                "bucket span and stat interval must be non-zero".to_string(),
            ));
        }

        let mut timers = self.timers.lock();
        if !timers.is_empty() {
            return Ok(());
        }
        timers.push(spawn_every(
            &runtime,
            Arc::downgrade(self),
            self.bucket_span,
            StatsWindow::rotate,
        ));
        timers.push(spawn_every(
            &runtime,
            Arc::downgrade(self),
            self.stat_interval,
            |window: &StatsWindow| {
                window.snapshot();
            },
        ));
        Ok(())
    }

    /// Cancel rotation and snapshot tasks; returns whether any were running
    pub fn stop(&self) -> bool {
        let timers: Vec<JoinHandle<()>> = self.timers.lock().drain(..).collect();
        let was_running = !timers.is_empty();
        for timer in timers {
            timer.abort();
        }
        was_running
    }

    pub fn is_running(&self) -> bool {
        !self.timers.lock().is_empty()
    }

    /// Register a success
    pub fn success(&self, latency_ms: u64) {
        self.record(|bucket| bucket.success(latency_ms));
    }

    /// Register a failure
    pub fn failure(&self, latency_ms: u64) {
        self.record(|bucket| bucket.failure(latency_ms));
    }

    /// Register a timeout
    pub fn timeout(&self, latency_ms: u64) {
        self.record(|bucket| bucket.timeout(latency_ms));
    }

    /// Register a short circuit
    pub fn short_circuit(&self) {
        self.record(Bucket::short_circuit);
    }

    /// Discard every bucket at once and publish one update
    pub fn reset(&self) {
        let totals = {
            let mut state = self.state.lock();
            state.buckets = (0..self.bucket_num).map(|_| Bucket::new()).collect();
            state.aggregate(false)
        };
        self.listeners.emit(&StatsEvent::Update(totals));
    }

    /// Advance the window by one bucket
    pub fn rotate(&self) {
        self.state.lock().shift_and_push();
    }

    /// Recompute totals with latency figures and publish them
    pub fn snapshot(&self) -> Totals {
        let totals = self.state.lock().aggregate(true);
        self.listeners.emit(&StatsEvent::Snapshot(totals.clone()));
        totals
    }

    /// Totals as of the last update or snapshot
    pub fn totals(&self) -> Totals {
        self.state.lock().totals.clone()
    }

    /// Copy of the bucket currently receiving outcomes
    pub fn active_bucket(&self) -> Bucket {
        self.state.lock().active().clone()
    }

    pub fn bucket_count(&self) -> usize {
        self.state.lock().buckets.len()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&StatsEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    fn record<F>(&self, apply: F)
    where
        F: FnOnce(&mut Bucket),
    {
        let totals = {
            let mut state = self.state.lock();
            apply(state.active());
            state.aggregate(false)
        };
        self.listeners.emit(&StatsEvent::Update(totals));
    }
}

impl Drop for StatsWindow {
    fn drop(&mut self) {
        for timer in self.timers.get_mut().drain(..) {
            timer.abort();
        }
    }
}

impl std::fmt::Debug for StatsWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsWindow")
            .field("bucket_span", &self.bucket_span)
            .field("bucket_num", &self.bucket_num)
            .field("stat_interval", &self.stat_interval)
            .field("totals", &self.state.lock().totals)
            .field("listeners", &self.listeners)
            .finish()
    }
}

fn spawn_every(
    runtime: &tokio::runtime::Handle,
    window: Weak<StatsWindow>,
    period: Duration,
    tick: fn(&StatsWindow),
) -> JoinHandle<()> {
    runtime.spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match window.upgrade() {
                Some(window) => tick(&window),
                None => break,
            }
        }
    })
}
