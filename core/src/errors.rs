//! Error types for breaker operations

use crate::BoxError;
use crate::stats::Totals;
use thiserror::Error;

/// Errors surfaced by [`CircuitBreaker::exec`](crate::CircuitBreaker::exec)
/// and [`Circuit::exec`](crate::Circuit::exec)
#[derive(Debug, Error)]
pub enum BrakesError {
    /// The operation did not settle within its time budget
    #[error("[Breaker: {breaker}] Request timed out after {timeout_ms}ms")]
    Timeout { breaker: String, timeout_ms: u64 },

    /// The circuit is open and no fallback was available
    #[error(
        "[Breaker: {breaker}] Circuit has been opened - The percentage of failed requests ({}%) is greater than the threshold specified ({}%)",
        failed_percent(.totals),
        threshold_percent(.threshold)
    )]
    CircuitOpen {
        breaker: String,
        totals: Totals,
        threshold: f64,
    },

    /// Invalid options, a missing operation, or no runtime to drive timers
    #[error("Invalid breaker configuration: {0}")]
    Configuration(String),

    /// The wrapped operation failed and no fallback was configured
    #[error("[Breaker: {breaker}] {source}")]
    Execution {
        breaker: String,
        #[source]
        source: BoxError,
    },

    /// The fallback itself failed; its error is passed through untouched
    #[error("{0}")]
    Fallback(BoxError),
}

impl BrakesError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BrakesError::Timeout { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, BrakesError::CircuitOpen { .. })
    }

    /// Name of the breaker that produced this error, when known
    pub fn breaker(&self) -> Option<&str> {
        match self {
            BrakesError::Timeout { breaker, .. }
            | BrakesError::CircuitOpen { breaker, .. }
            | BrakesError::Execution { breaker, .. } => Some(breaker),
            BrakesError::Configuration(_) | BrakesError::Fallback(_) => None,
        }
    }
}

/// A callback-style operation dropped its [`Done`](crate::Done) handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation dropped its completion handle without reporting a result")]
pub struct CallbackDropped;

/// Errors raised by the statistics layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatsError {
    #[error("Attempt to access nonexistent bucket property: {0}")]
    UnknownField(String),
}

/// Errors raised while transforming snapshots for the monitoring stream
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to parse raw snapshot record: {0}")]
    Deserialize(#[source] serde_json::Error),
}

fn failed_percent(totals: &Totals) -> u64 {
    if totals.total == 0 {
        return 0;
    }
    totals.total.saturating_sub(totals.successful) * 100 / totals.total
}

fn threshold_percent(threshold: &f64) -> f64 {
    (threshold * 1000.0).round() / 10.0
}
