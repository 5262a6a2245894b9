//! Builder API for ergonomic breaker configuration

use crate::{
    BrakesError, GlobalRegistry, HealthCheck, Operation,
    breaker::{CircuitBreaker, Config, Parts},
    events::BreakerEvent,
};
use std::sync::Arc;
use std::time::Duration;

type EventCallback = Arc<dyn Fn(&BreakerEvent) + Send + Sync>;

/// Builder for creating circuit breakers with fluent API
pub struct BreakerBuilder<A, T> {
    config: Config,
    master: Option<Operation<A, T>>,
    fallback: Option<Operation<A, T>>,
    health_check: Option<HealthCheck>,
    registry: Option<Arc<GlobalRegistry>>,
    callbacks: Vec<EventCallback>,
}

impl<A, T> BreakerBuilder<A, T>
where
    A: Clone + Send + 'static,
    T: Send + 'static,
{
    /// Create a new builder for a breaker with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: Config {
                name: name.into(),
                ..Config::default()
            },
            master: None,
            fallback: None,
            health_check: None,
            registry: None,
            callbacks: Vec::new(),
        }
    }

    /// Replace the whole configuration, keeping the builder's name
    pub fn config(mut self, config: Config) -> Self {
        let name = std::mem::take(&mut self.config.name);
        self.config = Config { name, ..config };
        self
    }

    /// Operation run by [`CircuitBreaker::exec`]
    pub fn operation(mut self, operation: Operation<A, T>) -> Self {
        self.master = Some(operation);
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.config.group = group.into();
        self
    }

    /// Set the length of one statistics bucket
    pub fn bucket_span(mut self, span: Duration) -> Self {
        self.config.bucket_span = span.as_millis() as u64;
        self
    }

    /// Set the number of buckets in the rolling window
    pub fn bucket_num(mut self, count: usize) -> Self {
        self.config.bucket_num = count;
        self
    }

    pub fn stat_interval(mut self, interval: Duration) -> Self {
        self.config.stat_interval = interval.as_millis() as u64;
        self
    }

    /// Set how long the circuit stays open without a health check
    pub fn circuit_duration(mut self, duration: Duration) -> Self {
        self.config.circuit_duration = duration.as_millis() as u64;
        self
    }

    /// Set the number of samples required before the ratio is evaluated
    pub fn wait_threshold(mut self, samples: u64) -> Self {
        self.config.wait_threshold = samples;
        self
    }

    /// Set the minimum success ratio (0.0-1.0)
    /// Circuit opens when (successful / total) < this value
    pub fn threshold(mut self, ratio: f64) -> Self {
        self.config.threshold = ratio;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout.as_millis() as u64;
        self
    }

    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.config.health_check_interval = interval.as_millis() as u64;
        self
    }

    /// Set the jitter factor (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: duration * (1 - jitter + rand * jitter)
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.config.jitter_factor = factor;
        self
    }

    /// Opt in or out of registry membership
    pub fn register_global(mut self, register: bool) -> Self {
        self.config.register_global = register;
        self
    }

    /// Register with `registry` instead of the process-wide one
    pub fn registry(mut self, registry: Arc<GlobalRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn fallback(mut self, fallback: Operation<A, T>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Recover by probing instead of waiting out the circuit duration
    pub fn health_check(mut self, check: HealthCheck) -> Self {
        self.health_check = Some(check);
        self
    }

    /// Set callback for when circuit opens
    pub fn on_open<F>(self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let name = self.config.name.clone();
        self.on_event(move |event| {
            if matches!(event, BreakerEvent::CircuitOpen) {
                f(&name);
            }
        })
    }

    /// Set callback for when circuit closes
    pub fn on_close<F>(self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let name = self.config.name.clone();
        self.on_event(move |event| {
            if matches!(event, BreakerEvent::CircuitClosed) {
                f(&name);
            }
        })
    }

    /// Listen to every breaker event for the breaker's whole life
    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&BreakerEvent) + Send + Sync + 'static,
    {
        self.callbacks.push(Arc::new(f));
        self
    }

    /// Build the breaker (requires a running tokio runtime)
    pub fn build(self) -> Result<CircuitBreaker<A, T>, BrakesError> {
        let breaker = CircuitBreaker::from_parts(Parts {
            config: self.config,
            master: self.master,
            fallback: self.fallback,
            health_check: self.health_check,
            registry: self.registry,
        })?;

        for callback in self.callbacks {
            breaker.on_event(move |event| callback(event)).detach();
        }
        Ok(breaker)
    }
}
