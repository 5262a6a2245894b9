//! Circuit breaker built on a state machine
//!
//! The breaker owns the Closed/Open state, the rolling statistics and the
//! recovery machinery. Operations run through it either as its master
//! operation ([`CircuitBreaker::exec`]) or through bound [`Circuit`]s.

use crate::{
    BoxError, BrakesError,
    circuit::{Circuit, CircuitOptions},
    events::{BreakerEvent, Listeners, Subscription},
    operation::{HealthCheck, Operation},
    registry::{GlobalRegistry, SnapshotPublisher},
    stats::{Snapshot, StatsEvent, StatsWindow, Totals},
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use state_machines::state_machine;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

static NEXT_BREAKER_ID: AtomicU64 = AtomicU64::new(1);

/// Breaker configuration
///
/// Deserializes from the camelCase option names (`bucketSpan`,
/// `waitThreshold`, ...). Missing keys take their defaults. All durations are
/// in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Length of one statistics bucket
    pub bucket_span: u64,

    /// Number of buckets in the rolling window
    #[serde(alias = "bucketCount")]
    pub bucket_num: usize,

    /// Interval between full snapshots
    pub stat_interval: u64,

    /// How long the circuit stays open when no health check is registered
    pub circuit_duration: u64,

    /// Samples required in the window before the success ratio is evaluated
    pub wait_threshold: u64,

    /// Minimum acceptable success ratio (0.0-1.0)
    pub threshold: f64,

    /// Time budget of a single call
    pub timeout: u64,

    /// Interval between health-check probes while open
    pub health_check_interval: u64,

    pub name: String,
    pub group: String,

    /// Register with the process-wide registry on construction
    pub register_global: bool,

    /// Jitter factor for circuit_duration (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: duration * (1 - jitter + rand * jitter)
    pub jitter_factor: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket_span: 1000,
            bucket_num: 60,
            stat_interval: 1200,
            circuit_duration: 30000,
            wait_threshold: 100,
            threshold: 0.5,
            timeout: 15000,
            health_check_interval: 5000,
            name: "defaultBrake".to_string(),
            group: "defaultBrakeGroup".to_string(),
            register_global: true,
            jitter_factor: 0.0,
        }
    }
}

impl Config {
    /// Reject configurations the breaker cannot run with
    pub fn validate(&self) -> Result<(), BrakesError> {
        let invalid = |message: &str| Err(BrakesError::Configuration(message.to_string()));

        if self.name.trim().is_empty() {
            return invalid("name must not be empty");
        }
        if self.bucket_span == 0 {
            return invalid("bucketSpan must be greater than 0");
        }
        if self.bucket_num == 0 {
            return invalid("bucketNum must be greater than 0");
        }
        if self.stat_interval == 0 {
            return invalid("statInterval must be greater than 0");
        }
        if self.timeout == 0 {
            return invalid("timeout must be greater than 0");
        }
        if self.health_check_interval == 0 {
            return invalid("healthCheckInterval must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return invalid("threshold must be between 0 and 1");
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return invalid("jitterFactor must be between 0 and 1");
        }
        Ok(())
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

/// Breaker context - shared data across all states
#[derive(Clone)]
pub struct BreakerContext {
    pub name: String,
    pub config: Config,
    pub stats: Arc<StatsWindow>,
}

impl Default for BreakerContext {
    fn default() -> Self {
        let config = Config::default();
        let stats = Arc::new(StatsWindow::new(
            Duration::from_millis(config.bucket_span),
            config.bucket_num,
            Duration::from_millis(config.stat_interval),
        ));
        Self {
            name: config.name.clone(),
            config,
            stats,
        }
    }
}

impl std::fmt::Debug for BreakerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerContext")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Data specific to the Open state
#[derive(Debug, Clone, Default)]
pub struct OpenData {
    /// Milliseconds since the Unix epoch
    pub opened_at: u64,
    pub generation: u64,
}

// Define the breaker state machine with dynamic mode
state_machine! {
    name: Brake,
    context: BreakerContext,
    dynamic: true,  // Enable dynamic mode for runtime state transitions

    initial: Closed,
    states: [
        Closed,
        Open(OpenData),
    ],
    events {
        trip {
            guards: [should_open],
            transition: { from: Closed, to: Open }
        }
    }
}

impl Brake<Closed> {
    /// Enough samples and a success ratio under the threshold
    fn should_open(&self, ctx: &BreakerContext) -> bool {
        let totals = ctx.stats.totals();
        if totals.total <= ctx.config.wait_threshold {
            return false;
        }
        (totals.successful as f64 / totals.total as f64) < ctx.config.threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Timeout,
}

struct Inner<A, T> {
    id: u64,
    context: BreakerContext,
    machine: Mutex<DynamicBrake>,
    generation: AtomicU64,
    runtime: tokio::runtime::Handle,
    master: Option<Operation<A, T>>,
    fallback: RwLock<Option<Operation<A, T>>>,
    health_check: RwLock<Option<HealthCheck>>,
    listeners: Listeners<BreakerEvent>,
    stats_subscription: Mutex<Option<Subscription>>,
    recovery: Mutex<Option<JoinHandle<()>>>,
    registry: Mutex<Option<Arc<GlobalRegistry>>>,
    disposed: AtomicBool,
}

/// Circuit breaker public API
///
/// Cloning is cheap and every clone drives the same breaker.
pub struct CircuitBreaker<A = (), T = ()> {
    inner: Arc<Inner<A, T>>,
}

impl<A, T> Clone for CircuitBreaker<A, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, T> CircuitBreaker<A, T>
where
    A: Clone + Send + 'static,
    T: Send + 'static,
{
    /// Create a new breaker builder
    pub fn builder(name: impl Into<String>) -> crate::builder::BreakerBuilder<A, T> {
        crate::builder::BreakerBuilder::new(name)
    }

    /// Create a breaker around `operation` (use builder() for more options)
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(operation: Operation<A, T>, config: Config) -> Result<Self, BrakesError> {
        Self::from_parts(Parts {
            config,
            master: Some(operation),
            ..Parts::default()
        })
    }

    pub(crate) fn from_parts(parts: Parts<A, T>) -> Result<Self, BrakesError> {
        let Parts {
            config,
            master,
            fallback,
            health_check,
            registry,
        } = parts;
        config.validate()?;

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            BrakesError::Configuration(
                "a breaker must be created inside a tokio runtime".to_string(),
            )
        })?;

        let stats = Arc::new(StatsWindow::new(
            Duration::from_millis(config.bucket_span),
            config.bucket_num,
            Duration::from_millis(config.stat_interval),
        ));
        let context = BreakerContext {
            name: config.name.clone(),
            config,
            stats,
        };
        let machine = DynamicBrake::new(context.clone());

        let inner = Arc::new(Inner {
            id: NEXT_BREAKER_ID.fetch_add(1, Ordering::Relaxed),
            context,
            machine: Mutex::new(machine),
            generation: AtomicU64::new(0),
            runtime,
            master,
            fallback: RwLock::new(fallback),
            health_check: RwLock::new(health_check),
            listeners: Listeners::new(),
            stats_subscription: Mutex::new(None),
            recovery: Mutex::new(None),
            registry: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });

        let weak: Weak<Inner<A, T>> = Arc::downgrade(&inner);
        let subscription = inner.context.stats.subscribe(move |event| {
            if let Some(inner) = weak.upgrade() {
                match event {
                    StatsEvent::Update(_) => inner.evaluate(),
                    StatsEvent::Snapshot(totals) => inner.publish_snapshot(totals.clone()),
                }
            }
        });
        *inner.stats_subscription.lock() = Some(subscription);
        inner.context.stats.start()?;

        let breaker = Self { inner };
        if breaker.inner.context.config.register_global {
            let registry = registry.unwrap_or_else(GlobalRegistry::global);
            registry.register(&breaker);
            *breaker.inner.registry.lock() = Some(registry);
        }

        tracing::debug!(
            breaker = %breaker.name(),
            group = %breaker.group(),
            "Breaker created"
        );
        Ok(breaker)
    }

    /// Run the master operation with breaker protection
    pub async fn exec(&self, args: A) -> Result<T, BrakesError> {
        let Some(master) = self.inner.master.clone() else {
            return Err(BrakesError::Configuration(format!(
                "breaker '{}' has no master operation, bind one with a Circuit",
                self.name()
            )));
        };
        self.execute(&master, None, self.inner.context.config.timeout_duration(), args)
            .await
    }

    /// Bind another operation to this breaker's state
    pub fn slave_circuit(&self, operation: Operation<A, T>) -> Circuit<A, T> {
        Circuit::new(self, operation)
    }

    /// Bind an operation with its own fallback and options
    pub fn slave_circuit_with(
        &self,
        operation: Operation<A, T>,
        fallback: Option<Operation<A, T>>,
        options: CircuitOptions,
    ) -> Result<Circuit<A, T>, BrakesError> {
        Circuit::with_options(self, operation, fallback, options)
    }

    /// Set the breaker-level fallback, replacing any previous one
    pub fn fallback(&self, fallback: Operation<A, T>) {
        *self.inner.fallback.write() = Some(fallback);
    }

    /// Recover through `check` instead of the fixed circuit duration
    pub fn health_check(&self, check: HealthCheck) {
        *self.inner.health_check.write() = Some(check);
    }

    /// Subscribe to breaker events
    pub fn on_event<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&BreakerEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(listener)
    }

    /// Deregister from the registry, stop every timer and drop all listeners
    ///
    /// The breaker keeps answering `is_open` afterwards but publishes nothing.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(registry) = self.inner.registry.lock().take() {
            registry.deregister(self);
        }
        self.inner.stats_subscription.lock().take();
        self.inner.context.stats.stop();
        if let Some(recovery) = self.inner.recovery.lock().take() {
            recovery.abort();
        }
        self.inner.listeners.clear();
        tracing::debug!(breaker = %self.name(), "Breaker disposed");
    }

    /// Execution path shared by `exec` and bound circuits
    pub(crate) async fn execute(
        &self,
        operation: &Operation<A, T>,
        fallback: Option<&Operation<A, T>>,
        timeout: Duration,
        args: A,
    ) -> Result<T, BrakesError> {
        let inner = &self.inner;
        inner.listeners.emit(&BreakerEvent::Exec);
        let fallback = fallback
            .cloned()
            .or_else(|| inner.fallback.read().clone());

        if inner.is_open() {
            inner.context.stats.short_circuit();
            tracing::debug!(breaker = %inner.context.name, "Call short-circuited");
            return match fallback {
                Some(fallback) => fallback.call(args).await.map_err(BrakesError::Fallback),
                None => Err(inner.open_error()),
            };
        }

        let generation = inner.generation.load(Ordering::SeqCst);
        let fallback_args = fallback.as_ref().map(|_| args.clone());
        let started = Instant::now();
        // the operation keeps running past the timeout, only the caller stops waiting
        let mut task = inner.runtime.spawn(operation.call(args));
        let settled = tokio::select! {
            joined = &mut task => Some(joined.unwrap_or_else(|e| Err(Box::new(e) as BoxError))),
            _ = tokio::time::sleep(timeout) => None,
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let error = match settled {
            Some(Ok(value)) => {
                inner.record(Outcome::Success, generation, latency_ms);
                return Ok(value);
            }
            Some(Err(source)) => {
                inner.record(Outcome::Failure, generation, latency_ms);
                BrakesError::Execution {
                    breaker: inner.context.name.clone(),
                    source,
                }
            }
            None => {
                let name = inner.context.name.clone();
                inner.runtime.spawn(async move {
                    if let Ok(late) = task.await {
                        tracing::debug!(
                            breaker = %name,
                            ok = late.is_ok(),
                            "Discarding result that settled after the timeout"
                        );
                    }
                });
                inner.record(Outcome::Timeout, generation, latency_ms);
                BrakesError::Timeout {
                    breaker: inner.context.name.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }
            }
        };

        match (fallback, fallback_args) {
            (Some(fallback), Some(args)) => {
                fallback.call(args).await.map_err(BrakesError::Fallback)
            }
            _ => Err(error),
        }
    }
}

impl<A, T> CircuitBreaker<A, T> {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.context.name
    }

    pub fn group(&self) -> &str {
        &self.inner.context.config.group
    }

    pub fn config(&self) -> &Config {
        &self.inner.context.config
    }

    /// Check if circuit is open
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Check if circuit is closed
    pub fn is_closed(&self) -> bool {
        !self.inner.is_open()
    }

    /// Get current state name
    pub fn state_name(&self) -> &'static str {
        self.inner.machine.lock().current_state()
    }

    /// Number of Closed -> Open transitions so far
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &Arc<StatsWindow> {
        &self.inner.context.stats
    }

    /// Totals as of the last recorded outcome or snapshot
    pub fn totals(&self) -> Totals {
        self.inner.context.stats.totals()
    }

    pub fn has_fallback(&self) -> bool {
        self.inner.fallback.read().is_some()
    }

    pub fn has_health_check(&self) -> bool {
        self.inner.health_check.read().is_some()
    }

    pub fn is_registered(&self) -> bool {
        self.inner.registry.lock().is_some()
    }
}

impl<A, T> std::fmt::Debug for CircuitBreaker<A, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("id", &self.inner.id)
            .field("name", &self.inner.context.name)
            .field("state", &self.state_name())
            .field("generation", &self.generation())
            .finish()
    }
}

impl<A, T> SnapshotPublisher for CircuitBreaker<A, T> {
    fn publisher_id(&self) -> u64 {
        self.inner.id
    }

    fn publisher_name(&self) -> &str {
        &self.inner.context.name
    }

    fn subscribe_snapshots(
        &self,
        listener: Box<dyn Fn(&Snapshot) + Send + Sync>,
    ) -> Subscription {
        self.inner.listeners.subscribe(move |event| {
            if let BreakerEvent::Snapshot(snapshot) = event {
                listener(snapshot);
            }
        })
    }
}

/// Everything a breaker is assembled from (used by builder)
pub(crate) struct Parts<A, T> {
    pub config: Config,
    pub master: Option<Operation<A, T>>,
    pub fallback: Option<Operation<A, T>>,
    pub health_check: Option<HealthCheck>,
    pub registry: Option<Arc<GlobalRegistry>>,
}

impl<A, T> Default for Parts<A, T> {
    fn default() -> Self {
        Self {
            config: Config::default(),
            master: None,
            fallback: None,
            health_check: None,
            registry: None,
        }
    }
}

impl<A, T> Inner<A, T> {
    fn is_open(&self) -> bool {
        self.machine.lock().current_state() == "Open"
    }

    fn open_error(&self) -> BrakesError {
        BrakesError::CircuitOpen {
            breaker: self.context.name.clone(),
            totals: self.context.stats.totals(),
            threshold: self.context.config.threshold,
        }
    }

    /// Record an outcome unless it belongs to an earlier generation
    fn record(&self, outcome: Outcome, generation: u64, latency_ms: u64) {
        let current = self.generation.load(Ordering::SeqCst);
        if current != generation {
            tracing::debug!(
                breaker = %self.context.name,
                generation,
                current,
                ?outcome,
                "Discarding outcome from a previous generation"
            );
            return;
        }

        tracing::debug!(breaker = %self.context.name, ?outcome, latency_ms, "Recording outcome");
        let stats = &self.context.stats;
        match outcome {
            Outcome::Success => {
                self.listeners.emit(&BreakerEvent::Success { latency_ms });
                stats.success(latency_ms);
            }
            Outcome::Failure => {
                self.listeners.emit(&BreakerEvent::Failure { latency_ms });
                stats.failure(latency_ms);
            }
            Outcome::Timeout => {
                self.listeners.emit(&BreakerEvent::Timeout { latency_ms });
                stats.timeout(latency_ms);
            }
        }
    }

    fn publish_snapshot(&self, stats: Totals) {
        let config = &self.context.config;
        let snapshot = Snapshot {
            name: self.context.name.clone(),
            group: config.group.clone(),
            time: now_millis(),
            open: self.is_open(),
            circuit_duration: config.circuit_duration,
            threshold: config.threshold,
            wait_threshold: config.wait_threshold,
            stats,
        };
        self.listeners
            .emit(&BreakerEvent::Snapshot(Arc::new(snapshot)));
    }

    /// Close the circuit if it is still open in `generation`
    fn recover(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation || !self.is_open() {
            return;
        }
        let closed = {
            let mut machine = self.machine.lock();
            if machine.current_state() == "Open" {
                // Recreate machine in Closed state
                *machine = DynamicBrake::new(self.context.clone());
                true
            } else {
                false
            }
        };

        if closed {
            // after the swap, so no short-circuit can land in the fresh window
            self.context.stats.reset();
            self.recovery.lock().take();
            tracing::info!(breaker = %self.context.name, generation, "Circuit closed");
            self.listeners.emit(&BreakerEvent::CircuitClosed);
        }
    }

    /// Delay before the fixed-timer recovery closes the circuit
    fn recovery_delay(&self) -> Duration {
        let config = &self.context.config;

        // Apply jitter using chrono-machines if jitter_factor > 0
        let delay_ms = if config.jitter_factor > 0.0 {
            let policy = chrono_machines::Policy {
                max_attempts: 1,
                base_delay_ms: config.circuit_duration,
                multiplier: 1.0,
                max_delay_ms: config.circuit_duration,
            };
            policy.calculate_delay(1, config.jitter_factor) as u64
        } else {
            config.circuit_duration
        };

        Duration::from_millis(delay_ms)
    }
}

impl<A, T> Inner<A, T>
where
    A: Send + 'static,
    T: Send + 'static,
{
    /// Trip the circuit if the window says so
    fn evaluate(self: &Arc<Self>) {
        let opened = {
            let mut machine = self.machine.lock();
            if machine.handle(BrakeEvent::Trip).is_ok() {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(data) = machine.open_data_mut() {
                    data.opened_at = now_millis();
                    data.generation = generation;
                }
                Some(generation)
            } else {
                None
            }
        };

        if let Some(generation) = opened {
            self.mark_open(generation);
        }
    }

    /// Apply Open-state bookkeeping (event + recovery)
    fn mark_open(self: &Arc<Self>, generation: u64) {
        let totals = self.context.stats.totals();
        tracing::info!(
            breaker = %self.context.name,
            generation,
            total = totals.total,
            successful = totals.successful,
            "Circuit opened"
        );
        self.listeners.emit(&BreakerEvent::CircuitOpen);

        let health_check = self.health_check.read().clone();
        let task = match health_check {
            Some(check) => self.spawn_health_checks(check, generation),
            None => self.spawn_recovery_timer(generation),
        };
        if let Some(previous) = self.recovery.lock().replace(task) {
            previous.abort();
        }
    }

    fn spawn_recovery_timer(self: &Arc<Self>, generation: u64) -> JoinHandle<()> {
        let delay = self.recovery_delay();
        let weak = Arc::downgrade(self);
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.recover(generation);
            }
        })
    }

    /// Probe on every tick while open
    ///
    /// Each probe runs as its own task, so a probe that never settles does not
    /// hold back later ticks. Outstanding probes are aborted with the poller.
    fn spawn_health_checks(self: &Arc<Self>, check: HealthCheck, generation: u64) -> JoinHandle<()> {
        let period = Duration::from_millis(self.context.config.health_check_interval);
        let weak = Arc::downgrade(self);
        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut pending = JoinSet::new();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        if !inner.is_open() || inner.generation.load(Ordering::SeqCst) != generation {
                            break;
                        }
                        pending.spawn(check.probe());
                    }
                    Some(joined) = pending.join_next() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let error = match joined {
                            Ok(Ok(())) => {
                                inner.recover(generation);
                                break;
                            }
                            Ok(Err(error)) => error.to_string(),
                            Err(join_error) => join_error.to_string(),
                        };
                        if inner.generation.load(Ordering::SeqCst) != generation {
                            break;
                        }
                        tracing::warn!(
                            breaker = %inner.context.name,
                            error = %error,
                            "Health check failed"
                        );
                        inner
                            .listeners
                            .emit(&BreakerEvent::HealthCheckFailed { error });
                    }
                }
            }
        })
    }
}

impl<A, T> Drop for Inner<A, T> {
    fn drop(&mut self) {
        if let Some(recovery) = self.recovery.get_mut().take() {
            recovery.abort();
        }
        if let Some(registry) = self.registry.get_mut().take() {
            registry.deregister_id(self.id);
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn isolated() -> Arc<GlobalRegistry> {
        Arc::new(GlobalRegistry::new())
    }

    fn record_events<A, T>(breaker: &CircuitBreaker<A, T>) -> (Arc<Mutex<Vec<&'static str>>>, Subscription)
    where
        A: Clone + Send + 'static,
        T: Send + 'static,
    {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let subscription = breaker.on_event(move |event| {
            if !matches!(event, BreakerEvent::Snapshot(_)) {
                seen_clone.lock().push(event.name());
            }
        });
        (seen, subscription)
    }

    fn count(seen: &Mutex<Vec<&'static str>>, name: &str) -> usize {
        seen.lock().iter().filter(|event| **event == name).count()
    }

    fn always_failing(calls: Arc<AtomicUsize>) -> Operation<(), ()> {
        Operation::new(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), BoxError>("service unavailable".into()) }
        })
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::default();

        assert_eq!(config.bucket_span, 1000);
        assert_eq!(config.bucket_num, 60);
        assert_eq!(config.stat_interval, 1200);
        assert_eq!(config.circuit_duration, 30000);
        assert_eq!(config.wait_threshold, 100);
        assert_eq!(config.threshold, 0.5);
        assert_eq!(config.timeout, 15000);
        assert_eq!(config.health_check_interval, 5000);
        assert_eq!(config.name, "defaultBrake");
        assert_eq!(config.group, "defaultBrakeGroup");
        assert!(config.register_global);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_deserializes_option_names() {
        let config: Config = serde_json::from_str(
            r#"{"name": "users", "waitThreshold": 2, "circuitDuration": 100, "timeout": 50, "registerGlobal": false}"#,
        )
        .unwrap();

        assert_eq!(config.name, "users");
        assert_eq!(config.wait_threshold, 2);
        assert_eq!(config.circuit_duration, 100);
        assert_eq!(config.timeout, 50);
        assert!(!config.register_global);
        assert_eq!(config.bucket_num, 60);
        assert_eq!(config.group, "defaultBrakeGroup");
    }

    #[test]
    fn test_config_validation() {
        let cases = [
            Config {
                threshold: 1.5,
                ..Config::default()
            },
            Config {
                bucket_num: 0,
                ..Config::default()
            },
            Config {
                stat_interval: 0,
                ..Config::default()
            },
            Config {
                name: "  ".to_string(),
                ..Config::default()
            },
            Config {
                jitter_factor: -0.1,
                ..Config::default()
            },
        ];

        for config in cases {
            assert!(
                matches!(config.validate(), Err(BrakesError::Configuration(_))),
                "{:?} should be rejected",
                config
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_timer_recovery() {
        let calls = Arc::new(AtomicUsize::new(0));
        let breaker = CircuitBreaker::builder("fixed")
            .threshold(0.5)
            .wait_threshold(2)
            .timeout(Duration::from_millis(50))
            .circuit_duration(Duration::from_millis(100))
            .operation(always_failing(calls.clone()))
            .registry(isolated())
            .build()
            .unwrap();

        for _ in 0..3 {
            let err = breaker.exec(()).await.unwrap_err();
            assert!(matches!(err, BrakesError::Execution { .. }));
        }
        assert!(breaker.is_open());
        assert_eq!(breaker.generation(), 1);

        let err = breaker.exec(()).await.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("(100%)"));

        tokio::time::sleep(Duration::from_millis(110)).await;

        assert!(!breaker.is_open());
        let totals = breaker.totals();
        assert_eq!(totals.total, 0);
        assert_eq!(totals.failed, 0);
        assert_eq!(totals.short_circuited, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_recovery() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let breaker = CircuitBreaker::builder("polled")
            .wait_threshold(2)
            .health_check_interval(Duration::from_millis(50))
            .operation(always_failing(Arc::new(AtomicUsize::new(0))))
            .health_check(HealthCheck::new(move || {
                let attempt = attempts_clone.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err::<(), BoxError>("still warming up".into())
                    } else {
                        Ok(())
                    }
                }
            }))
            .registry(isolated())
            .build()
            .unwrap();
        let (seen, _subscription) = record_events(&breaker);

        for _ in 0..3 {
            let _ = breaker.exec(()).await;
        }
        assert!(breaker.is_open());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(breaker.is_open());
        assert_eq!(count(&seen, "healthCheckFailed"), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(breaker.is_closed());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(breaker.totals().total, 0);
        assert_eq!(count(&seen, "circuitOpen"), 1);
        assert_eq!(count(&seen, "circuitClosed"), 1);

        // polling stopped after the circuit closed
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_exactly_once() {
        let breaker: CircuitBreaker = CircuitBreaker::builder("once")
            .threshold(0.5)
            .wait_threshold(100)
            .registry(isolated())
            .build()
            .unwrap();
        let (seen, _subscription) = record_events(&breaker);

        breaker.stats().success(5);
        for _ in 0..200 {
            breaker.stats().failure(5);
        }

        assert!(breaker.is_open());
        assert_eq!(breaker.generation(), 1);
        assert_eq!(count(&seen, "circuitOpen"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stays_closed_until_wait_threshold() {
        let breaker: CircuitBreaker = CircuitBreaker::builder("patient")
            .wait_threshold(5)
            .registry(isolated())
            .build()
            .unwrap();

        for _ in 0..5 {
            breaker.stats().failure(1);
        }
        assert!(breaker.is_closed());

        breaker.stats().failure(1);
        assert!(breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_recorded_once() {
        let finished = Arc::new(AtomicBool::new(false));
        let finished_clone = finished.clone();
        let breaker = CircuitBreaker::builder("slow")
            .timeout(Duration::from_millis(50))
            .operation(Operation::new(move |_: ()| {
                let finished = finished_clone.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    finished.store(true, Ordering::SeqCst);
                    Ok::<_, BoxError>(())
                }
            }))
            .registry(isolated())
            .build()
            .unwrap();
        let (seen, _subscription) = record_events(&breaker);

        let err = breaker.exec(()).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(!finished.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(300)).await;

        // the caller stopped waiting but the operation itself was not cancelled
        assert!(finished.load(Ordering::SeqCst));
        let bucket = breaker.stats().active_bucket();
        assert_eq!(bucket.timed_out, 1);
        assert_eq!(bucket.failed, 0);
        assert_eq!(bucket.total, 1);
        assert_eq!(count(&seen, "timeout"), 1);
        assert_eq!(count(&seen, "success"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_circuit_fallback_emits_no_outcome() {
        let breaker = CircuitBreaker::builder("degraded")
            .wait_threshold(2)
            .operation(always_failing(Arc::new(AtomicUsize::new(0))))
            .registry(isolated())
            .build()
            .unwrap();
        for _ in 0..3 {
            let _ = breaker.exec(()).await;
        }
        assert!(breaker.is_open());

        breaker.fallback(Operation::new(|_| async { Ok(()) }));
        let (seen, subscription) = record_events(&breaker);
        assert!(breaker.exec(()).await.is_ok());
        assert_eq!(*seen.lock(), vec!["exec"]);
        drop(subscription);

        breaker.fallback(Operation::new(|_| async {
            Err::<(), BoxError>("fallback exhausted".into())
        }));
        let err = breaker.exec(()).await.unwrap_err();
        assert!(matches!(err, BrakesError::Fallback(_)));
        assert_eq!(err.to_string(), "fallback exhausted");
        assert_eq!(breaker.totals().short_circuited, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_on_failure_and_timeout() {
        let breaker = CircuitBreaker::builder("rescued")
            .timeout(Duration::from_millis(20))
            .operation(Operation::new(|delay: u64| async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Err::<u64, BoxError>("boom".into())
            }))
            .fallback(Operation::new(|delay| async move { Ok(delay + 1) }))
            .registry(isolated())
            .build()
            .unwrap();

        assert_eq!(breaker.exec(1).await.unwrap(), 2);
        assert_eq!(breaker.exec(100).await.unwrap(), 101);

        let totals = breaker.totals();
        assert_eq!(totals.failed, 1);
        assert_eq!(totals.timed_out, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_is_discarded() {
        let breaker: CircuitBreaker = CircuitBreaker::builder("generations")
            .wait_threshold(2)
            .timeout(Duration::from_secs(1))
            .circuit_duration(Duration::from_secs(10))
            .registry(isolated())
            .build()
            .unwrap();
        let (seen, _subscription) = record_events(&breaker);

        let slow = breaker.slave_circuit(Operation::new(|_| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }));
        let in_flight = tokio::spawn(async move { slow.exec(()).await });
        tokio::task::yield_now().await;

        let failing = breaker.slave_circuit(always_failing(Arc::new(AtomicUsize::new(0))));
        for _ in 0..3 {
            let _ = failing.exec(()).await;
        }
        assert!(breaker.is_open());
        assert_eq!(breaker.generation(), 1);

        // the caller still gets its value, the stats never see it
        assert!(in_flight.await.unwrap().is_ok());
        assert_eq!(breaker.totals().successful, 0);
        assert_eq!(breaker.totals().total, 3);
        assert_eq!(count(&seen, "success"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_failure_and_post_recovery_result_are_discarded() {
        let breaker: CircuitBreaker = CircuitBreaker::builder("late")
            .wait_threshold(2)
            .timeout(Duration::from_secs(1))
            .circuit_duration(Duration::from_millis(100))
            .registry(isolated())
            .build()
            .unwrap();
        let (seen, _subscription) = record_events(&breaker);

        let failing_late = breaker.slave_circuit(Operation::new(|_| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err::<(), BoxError>("late failure".into())
        }));
        let succeeding_late = breaker.slave_circuit(Operation::new(|_| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(())
        }));
        let stale_failure = tokio::spawn(async move { failing_late.exec(()).await });
        let stale_success = tokio::spawn(async move { succeeding_late.exec(()).await });
        tokio::task::yield_now().await;

        let failing = breaker.slave_circuit(always_failing(Arc::new(AtomicUsize::new(0))));
        for _ in 0..3 {
            let _ = failing.exec(()).await;
        }
        assert!(breaker.is_open());
        assert_eq!(count(&seen, "failure"), 3);

        // settles while still open, one generation later
        assert!(stale_failure.await.unwrap().is_err());
        assert_eq!(breaker.totals().total, 3);
        assert_eq!(breaker.totals().failed, 3);
        assert_eq!(count(&seen, "failure"), 3);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(breaker.is_closed());
        assert_eq!(breaker.generation(), 1);
        assert_eq!(breaker.totals().total, 0);

        // settles after recovery into a fresh window
        assert!(stale_success.await.unwrap().is_ok());
        assert_eq!(breaker.totals().total, 0);
        assert_eq!(breaker.stats().active_bucket().total, 0);
        assert_eq!(count(&seen, "success"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_health_check_does_not_block_later_ticks() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let breaker = CircuitBreaker::builder("hung")
            .wait_threshold(2)
            .health_check_interval(Duration::from_millis(50))
            .operation(always_failing(Arc::new(AtomicUsize::new(0))))
            .health_check(HealthCheck::new(move || {
                let attempt = attempts_clone.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        futures::future::pending::<()>().await;
                    }
                    Ok::<(), BoxError>(())
                }
            }))
            .registry(isolated())
            .build()
            .unwrap();

        for _ in 0..3 {
            let _ = breaker.exec(()).await;
        }
        assert!(breaker.is_open());

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(breaker.is_closed());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_closes_before_resetting_stats() {
        let breaker = CircuitBreaker::builder("ordered")
            .wait_threshold(2)
            .circuit_duration(Duration::from_millis(100))
            .operation(always_failing(Arc::new(AtomicUsize::new(0))))
            .registry(isolated())
            .build()
            .unwrap();
        for _ in 0..3 {
            let _ = breaker.exec(()).await;
        }
        assert!(breaker.is_open());

        let open_during_reset = Arc::new(Mutex::new(Vec::new()));
        let open_clone = open_during_reset.clone();
        let observer = breaker.clone();
        let _subscription = breaker.stats().subscribe(move |event| {
            if let StatsEvent::Update(totals) = event
                && totals.total == 0
            {
                open_clone.lock().push(observer.is_open());
            }
        });

        tokio::time::sleep(Duration::from_millis(110)).await;

        assert!(breaker.is_closed());
        assert_eq!(*open_during_reset.lock(), vec![false]);
        assert_eq!(breaker.totals().short_circuited, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_operation() {
        let breaker = CircuitBreaker::builder("callbacks")
            .operation(Operation::from_callback(|n: u32, done: crate::Done<u32>| {
                if n == 0 {
                    done.err("zero");
                } else {
                    done.ok(n * 10);
                }
            }))
            .registry(isolated())
            .build()
            .unwrap();

        assert_eq!(breaker.exec(3).await.unwrap(), 30);
        assert_eq!(
            breaker.exec(0).await.unwrap_err().to_string(),
            "[Breaker: callbacks] zero"
        );
        assert_eq!(breaker.totals().successful, 1);
        assert_eq!(breaker.totals().failed, 1);
    }

    #[tokio::test]
    async fn test_exec_without_operation() {
        let breaker: CircuitBreaker = CircuitBreaker::builder("empty")
            .registry(isolated())
            .build()
            .unwrap();

        let err = breaker.exec(()).await.unwrap_err();
        assert!(matches!(err, BrakesError::Configuration(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_jittered_recovery_delay() {
        let breaker: CircuitBreaker = CircuitBreaker::builder("jitter")
            .circuit_duration(Duration::from_millis(1000))
            .jitter_factor(0.5)
            .registry(isolated())
            .build()
            .unwrap();

        for _ in 0..20 {
            let delay = breaker.inner.recovery_delay();
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(1000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose() {
        let registry = isolated();
        let breaker: CircuitBreaker = CircuitBreaker::builder("disposable")
            .registry(registry.clone())
            .build()
            .unwrap();
        breaker.on_event(|_| {}).detach();
        assert_eq!(registry.instance_count(), 1);
        assert!(breaker.stats().is_running());

        breaker.dispose();
        breaker.dispose();

        assert_eq!(registry.instance_count(), 0);
        assert!(!breaker.stats().is_running());
        assert!(!breaker.is_registered());
        assert!(breaker.inner.listeners.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_event_payload() {
        let breaker: CircuitBreaker = CircuitBreaker::builder("snapshots")
            .group("reports")
            .stat_interval(Duration::from_millis(100))
            .registry(isolated())
            .build()
            .unwrap();
        let snapshots = Arc::new(Mutex::new(Vec::new()));
        let snapshots_clone = snapshots.clone();
        let _subscription = breaker.on_event(move |event| {
            if let BreakerEvent::Snapshot(snapshot) = event {
                snapshots_clone.lock().push(snapshot.clone());
            }
        });

        breaker.stats().success(12);
        tokio::time::sleep(Duration::from_millis(150)).await;

        let snapshots = snapshots.lock();
        let snapshot = snapshots.first().unwrap();
        assert_eq!(snapshot.name, "snapshots");
        assert_eq!(snapshot.group, "reports");
        assert!(!snapshot.open);
        assert_eq!(snapshot.wait_threshold, 100);
        assert_eq!(snapshot.stats.successful, 1);
        assert_eq!(snapshot.stats.percentiles.p100, 12);
    }
}
