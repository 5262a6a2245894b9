//! Operations bound to a breaker
//!
//! A [`Circuit`] shares its breaker's state and statistics but carries its own
//! operation, an optional fallback and an optional timeout override.

use crate::{BrakesError, CircuitBreaker, Operation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-circuit options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitOptions {
    /// Overrides the breaker timeout (milliseconds)
    pub timeout: Option<u64>,
}

pub struct Circuit<A, T> {
    breaker: CircuitBreaker<A, T>,
    operation: Operation<A, T>,
    fallback: Option<Operation<A, T>>,
    timeout: Option<Duration>,
}

impl<A, T> Circuit<A, T>
where
    A: Clone + Send + 'static,
    T: Send + 'static,
{
    pub fn new(breaker: &CircuitBreaker<A, T>, operation: Operation<A, T>) -> Self {
        Self {
            breaker: breaker.clone(),
            operation,
            fallback: None,
            timeout: None,
        }
    }

    /// Build a circuit from deserialized options
    pub fn with_options(
        breaker: &CircuitBreaker<A, T>,
        operation: Operation<A, T>,
        fallback: Option<Operation<A, T>>,
        options: CircuitOptions,
    ) -> Result<Self, BrakesError> {
        if options.timeout == Some(0) {
            return Err(BrakesError::Configuration(format!(
                "circuit timeout for breaker '{}' must be greater than 0",
                breaker.name()
            )));
        }
        Ok(Self {
            breaker: breaker.clone(),
            operation,
            fallback,
            timeout: options.timeout.map(Duration::from_millis),
        })
    }

    /// Use `fallback` instead of the breaker-level one
    pub fn with_fallback(mut self, fallback: Operation<A, T>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Effective time budget for one call
    pub fn timeout(&self) -> Duration {
        self.timeout
            .unwrap_or_else(|| self.breaker.config().timeout_duration())
    }

    pub fn breaker(&self) -> &CircuitBreaker<A, T> {
        &self.breaker
    }

    /// Run the operation under the breaker
    ///
    /// Short-circuits while the breaker is open. Failures and timeouts go to the
    /// circuit fallback, then the breaker fallback, then back to the caller.
    pub async fn exec(&self, args: A) -> Result<T, BrakesError> {
        self.breaker
            .execute(&self.operation, self.fallback.as_ref(), self.timeout(), args)
            .await
    }
}

impl<A, T> Clone for Circuit<A, T> {
    fn clone(&self) -> Self {
        Self {
            breaker: self.breaker.clone(),
            operation: self.operation.clone(),
            fallback: self.fallback.clone(),
            timeout: self.timeout,
        }
    }
}

impl<A, T> std::fmt::Debug for Circuit<A, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit")
            .field("breaker", &self.breaker.name())
            .field("has_fallback", &self.fallback.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}
