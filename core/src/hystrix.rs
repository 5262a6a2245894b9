//! Hystrix dashboard records
//!
//! Maps breaker snapshots onto the Hystrix `HystrixCommand` stream format.
//! Counters the breaker does not track are reported as zero.

use crate::errors::RegistryError;
use crate::stats::Snapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Percentile keys used by the dashboard, aligned with [`crate::stats::PERCENTILES`]
const LATENCY_KEYS: [&str; 9] = ["0", "25", "50", "75", "90", "95", "99", "99.5", "100"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HystrixRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub group: String,
    pub current_time: u64,
    pub is_circuit_breaker_open: bool,
    pub error_percentage: u64,
    pub error_count: u64,
    pub request_count: u64,
    pub rolling_count_bad_requests: u64,
    pub rolling_count_collapsed_requests: u64,
    pub rolling_count_exceptions_thrown: u64,
    pub rolling_count_failure: u64,
    pub rolling_count_fallback_failure: u64,
    pub rolling_count_fallback_rejection: u64,
    pub rolling_count_fallback_success: u64,
    pub rolling_count_responses_from_cache: u64,
    pub rolling_count_semaphore_rejected: u64,
    pub rolling_count_short_circuited: u64,
    pub rolling_count_success: u64,
    pub rolling_count_thread_pool_rejected: u64,
    pub rolling_count_timeout: u64,
    pub current_concurrent_execution_count: u64,
    #[serde(rename = "latencyExecute_mean")]
    pub latency_execute_mean: u64,
    pub latency_execute: BTreeMap<String, u64>,
    #[serde(rename = "latencyTotal_mean")]
    pub latency_total_mean: u64,
    pub latency_total: BTreeMap<String, u64>,
    #[serde(rename = "propertyValue_circuitBreakerRequestVolumeThreshold")]
    pub property_value_circuit_breaker_request_volume_threshold: u64,
    #[serde(rename = "propertyValue_circuitBreakerSleepWindowInMilliseconds")]
    pub property_value_circuit_breaker_sleep_window_in_milliseconds: u64,
    #[serde(rename = "propertyValue_circuitBreakerErrorThresholdPercentage")]
    pub property_value_circuit_breaker_error_threshold_percentage: f64,
    #[serde(rename = "propertyValue_circuitBreakerForceOpen")]
    pub property_value_circuit_breaker_force_open: bool,
    #[serde(rename = "propertyValue_circuitBreakerForceClosed")]
    pub property_value_circuit_breaker_force_closed: bool,
    #[serde(rename = "propertyValue_circuitBreakerEnabled")]
    pub property_value_circuit_breaker_enabled: bool,
    #[serde(rename = "propertyValue_executionIsolationStrategy")]
    pub property_value_execution_isolation_strategy: String,
    #[serde(rename = "propertyValue_executionIsolationThreadTimeoutInMilliseconds")]
    pub property_value_execution_isolation_thread_timeout_in_milliseconds: u64,
    #[serde(rename = "propertyValue_executionIsolationThreadInterruptOnTimeout")]
    pub property_value_execution_isolation_thread_interrupt_on_timeout: bool,
    #[serde(rename = "propertyValue_executionIsolationThreadPoolKeyOverride")]
    pub property_value_execution_isolation_thread_pool_key_override: Option<String>,
    #[serde(rename = "propertyValue_executionIsolationSemaphoreMaxConcurrentRequests")]
    pub property_value_execution_isolation_semaphore_max_concurrent_requests: u64,
    #[serde(rename = "propertyValue_fallbackIsolationSemaphoreMaxConcurrentRequests")]
    pub property_value_fallback_isolation_semaphore_max_concurrent_requests: u64,
    #[serde(rename = "propertyValue_metricsRollingStatisticalWindowInMilliseconds")]
    pub property_value_metrics_rolling_statistical_window_in_milliseconds: u64,
    #[serde(rename = "propertyValue_requestCacheEnabled")]
    pub property_value_request_cache_enabled: bool,
    #[serde(rename = "propertyValue_requestLogEnabled")]
    pub property_value_request_log_enabled: bool,
    pub reporting_hosts: u64,
}

impl From<&Snapshot> for HystrixRecord {
    fn from(snapshot: &Snapshot) -> Self {
        let stats = &snapshot.stats;
        let error_percentage = if stats.total == 0 {
            0
        } else {
            ((1.0 - stats.successful as f64 / stats.total as f64) * 100.0).round() as u64
        };
        let latency: BTreeMap<String, u64> = LATENCY_KEYS
            .iter()
            .zip(stats.percentiles.values())
            .map(|(key, (_, value))| (key.to_string(), value))
            .collect();

        Self {
            kind: "HystrixCommand".to_string(),
            name: snapshot.name.clone(),
            group: snapshot.group.clone(),
            current_time: snapshot.time,
            is_circuit_breaker_open: snapshot.open,
            error_percentage,
            error_count: stats.failed,
            request_count: stats.total,
            rolling_count_bad_requests: 0,
            rolling_count_collapsed_requests: 0,
            rolling_count_exceptions_thrown: 0,
            rolling_count_failure: stats.failed,
            rolling_count_fallback_failure: 0,
            rolling_count_fallback_rejection: 0,
            rolling_count_fallback_success: 0,
            rolling_count_responses_from_cache: 0,
            rolling_count_semaphore_rejected: 0,
            rolling_count_short_circuited: stats.short_circuited,
            rolling_count_success: stats.successful,
            rolling_count_thread_pool_rejected: 0,
            rolling_count_timeout: stats.timed_out,
            current_concurrent_execution_count: 0,
            latency_execute_mean: stats.latency_mean,
            latency_execute: latency.clone(),
            latency_total_mean: stats.latency_mean,
            latency_total: latency,
            property_value_circuit_breaker_request_volume_threshold: snapshot.wait_threshold,
            property_value_circuit_breaker_sleep_window_in_milliseconds: snapshot.circuit_duration,
            property_value_circuit_breaker_error_threshold_percentage: snapshot.threshold,
            property_value_circuit_breaker_force_open: false,
            property_value_circuit_breaker_force_closed: false,
            property_value_circuit_breaker_enabled: true,
            property_value_execution_isolation_strategy: "THREAD".to_string(),
            property_value_execution_isolation_thread_timeout_in_milliseconds: 800,
            property_value_execution_isolation_thread_interrupt_on_timeout: true,
            property_value_execution_isolation_thread_pool_key_override: None,
            property_value_execution_isolation_semaphore_max_concurrent_requests: 20,
            property_value_fallback_isolation_semaphore_max_concurrent_requests: 10,
            property_value_metrics_rolling_statistical_window_in_milliseconds: 10000,
            property_value_request_cache_enabled: false,
            property_value_request_log_enabled: false,
            reporting_hosts: 1,
        }
    }
}

impl HystrixRecord {
    /// Render as a server-sent-events frame (`data: <json>\n\n`)
    pub fn to_frame(&self) -> Result<String, RegistryError> {
        let json = serde_json::to_string(self).map_err(RegistryError::Serialize)?;
        Ok(format!("data: {json}\n\n"))
    }
}

/// Turn one raw snapshot record into a Hystrix frame
pub fn transform(raw: &str) -> Result<String, RegistryError> {
    let snapshot: Snapshot = serde_json::from_str(raw).map_err(RegistryError::Deserialize)?;
    HystrixRecord::from(&snapshot).to_frame()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{LatencyPercentiles, Totals};
    use serde_json::Value;

    fn snapshot(total: u64, successful: u64) -> Snapshot {
        Snapshot {
            name: "users".to_string(),
            group: "accounts".to_string(),
            time: 1_700_000_000_000,
            open: false,
            circuit_duration: 30000,
            threshold: 0.5,
            wait_threshold: 100,
            stats: Totals {
                total,
                successful,
                failed: total - successful,
                latency_mean: 42,
                percentiles: LatencyPercentiles::from_sorted(&[10, 20, 30, 40]),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_error_percentage() {
        assert_eq!(HystrixRecord::from(&snapshot(10, 10)).error_percentage, 0);
        assert_eq!(HystrixRecord::from(&snapshot(3, 1)).error_percentage, 67);
        assert_eq!(HystrixRecord::from(&snapshot(0, 0)).error_percentage, 0);
    }

    #[test]
    fn test_frame_field_names() {
        let frame = HystrixRecord::from(&snapshot(4, 3)).to_frame().unwrap();
        assert!(frame.starts_with("data: "));
        assert!(frame.ends_with("\n\n"));

        let json: Value = serde_json::from_str(frame.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(json["type"], "HystrixCommand");
        assert_eq!(json["name"], "users");
        assert_eq!(json["group"], "accounts");
        assert_eq!(json["requestCount"], 4);
        assert_eq!(json["errorCount"], 1);
        assert_eq!(json["rollingCountSuccess"], 3);
        assert_eq!(json["latencyExecute_mean"], 42);
        assert_eq!(json["latencyExecute"]["100"], 40);
        assert_eq!(json["latencyTotal"]["99.5"], 40);
        assert_eq!(json["propertyValue_circuitBreakerRequestVolumeThreshold"], 100);
        assert_eq!(json["propertyValue_circuitBreakerSleepWindowInMilliseconds"], 30000);
        assert_eq!(json["propertyValue_executionIsolationStrategy"], "THREAD");
        assert!(json["propertyValue_executionIsolationThreadPoolKeyOverride"].is_null());
        assert_eq!(json["reportingHosts"], 1);
    }

    #[test]
    fn test_transform_raw_record() {
        let raw = serde_json::to_string(&snapshot(2, 2)).unwrap();
        let frame = transform(&raw).unwrap();
        assert!(frame.contains("\"isCircuitBreakerOpen\":false"));

        assert!(matches!(
            transform("{not json"),
            Err(RegistryError::Deserialize(_))
        ));
    }
}
