//! A single time slice of the rolling statistics window

use crate::errors::StatsError;
use std::str::FromStr;

/// Counter fields a percentage can be requested for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketField {
    Total,
    Successful,
    Failed,
    TimedOut,
    ShortCircuited,
}

impl FromStr for BucketField {
    type Err = StatsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "total" => Ok(BucketField::Total),
            "successful" => Ok(BucketField::Successful),
            "failed" => Ok(BucketField::Failed),
            "timedOut" | "timed_out" => Ok(BucketField::TimedOut),
            "shortCircuited" | "short_circuited" => Ok(BucketField::ShortCircuited),
            other => Err(StatsError::UnknownField(other.to_string())),
        }
    }
}

/// Outcome counters and latency samples for one bucket span
///
/// `total` always equals `successful + failed + timed_out`. Short-circuited
/// calls never ran, so they are counted apart and carry no latency sample.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bucket {
    pub(crate) total: u64,
    pub(crate) successful: u64,
    pub(crate) failed: u64,
    pub(crate) timed_out: u64,
    pub(crate) short_circuited: u64,
    pub(crate) request_times: Vec<u64>,
}

impl Bucket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a success
    pub fn success(&mut self, latency_ms: u64) {
        self.total += 1;
        self.successful += 1;
        self.request_times.push(latency_ms);
    }

    /// Register a failure
    pub fn failure(&mut self, latency_ms: u64) {
        self.total += 1;
        self.failed += 1;
        self.request_times.push(latency_ms);
    }

    /// Register a timeout
    pub fn timeout(&mut self, latency_ms: u64) {
        self.total += 1;
        self.timed_out += 1;
        self.request_times.push(latency_ms);
    }

    /// Register a short circuit
    pub fn short_circuit(&mut self) {
        self.short_circuited += 1;
    }

    /// Ratio of `field` to `total`, or 0 for an empty bucket
    pub fn percent(&self, field: BucketField) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.count(field) as f64 / self.total as f64
    }

    /// Same as [`percent`](Self::percent) with the field given by name
    pub fn percent_of(&self, field: &str) -> Result<f64, StatsError> {
        field.parse().map(|field| self.percent(field))
    }

    pub fn count(&self, field: BucketField) -> u64 {
        match field {
            BucketField::Total => self.total,
            BucketField::Successful => self.successful,
            BucketField::Failed => self.failed,
            BucketField::TimedOut => self.timed_out,
            BucketField::ShortCircuited => self.short_circuited,
        }
    }

    pub fn request_times(&self) -> &[u64] {
        &self.request_times
    }
}
