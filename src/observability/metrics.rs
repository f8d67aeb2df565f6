use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Instant;

use crate::error::{AppError, Result};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static INSTALL_LOCK: Mutex<()> = Mutex::new(());

/// Global metrics instance.
pub static METRICS: Metrics = Metrics;

/// Metrics collector for idempotency and retry activity.
///
/// Calls are no-ops until a recorder is installed with [`init_metrics`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Metrics;

impl Metrics {
    pub fn new() -> Self {
        Metrics
    }

    /// `verdict` is one of `new`, `completed`, `in_progress`.
    pub fn record_idempotency_check(&self, operation_type: &str, verdict: &str) {
        counter!("idempotency_checks_total", "operation" => operation_type.to_string(), "verdict" => verdict.to_string()).increment(1);
    }

    pub fn record_idempotency_cache_hit(&self, operation_type: &str) {
        counter!("idempotency_cache_hits_total", "operation" => operation_type.to_string()).increment(1);
    }

    pub fn record_idempotency_completed(&self, operation_type: &str) {
        counter!("idempotency_completed_total", "operation" => operation_type.to_string()).increment(1);
    }

    pub fn record_idempotency_failed(&self, operation_type: &str) {
        counter!("idempotency_failed_total", "operation" => operation_type.to_string()).increment(1);
    }

    pub fn record_idempotency_released(&self, operation_type: &str) {
        counter!("idempotency_released_total", "operation" => operation_type.to_string()).increment(1);
    }

    pub fn record_idempotency_cleanup(&self, removed: u64) {
        counter!("idempotency_cleanup_removed_total").increment(removed);
    }

    pub fn record_storage_operation(&self, backend: &str, operation: &str, duration_ms: f64, success: bool) {
        counter!("idempotency_storage_operations_total", "backend" => backend.to_string(), "operation" => operation.to_string(), "success" => success.to_string()).increment(1);
        histogram!("idempotency_storage_duration_ms", "backend" => backend.to_string(), "operation" => operation.to_string()).record(duration_ms);
    }

    pub fn record_retry_attempt(&self, strategy: &str, success: bool) {
        counter!("retry_attempts_total", "strategy" => strategy.to_string(), "success" => success.to_string()).increment(1);
    }

    pub fn record_retry_delay(&self, strategy: &str, delay_ms: u64) {
        histogram!("retry_delay_ms", "strategy" => strategy.to_string()).record(delay_ms as f64);
    }

    pub fn record_retry_outcome(&self, strategy: &str, outcome: &str, attempts: u32) {
        counter!("retry_outcomes_total", "strategy" => strategy.to_string(), "outcome" => outcome.to_string()).increment(1);
        histogram!("retry_attempts_per_execution", "strategy" => strategy.to_string()).record(attempts as f64);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the Prometheus recorder once and returns its handle.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let _install = INSTALL_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to install Prometheus recorder: {}", e)))?;
    describe_metrics();

    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

/// Describes all metrics for Prometheus.
fn describe_metrics() {
    describe_counter!("idempotency_checks_total", Unit::Count, "Idempotency checks by verdict");
    describe_counter!("idempotency_cache_hits_total", Unit::Count, "Checks answered from the local cache");
    describe_counter!("idempotency_completed_total", Unit::Count, "Operations recorded as completed");
    describe_counter!("idempotency_failed_total", Unit::Count, "Operations recorded as failed");
    describe_counter!("idempotency_released_total", Unit::Count, "Idempotency locks released without a result");
    describe_counter!("idempotency_cleanup_removed_total", Unit::Count, "Expired idempotency records removed");

    describe_counter!("idempotency_storage_operations_total", Unit::Count, "Idempotency storage operations");
    describe_histogram!("idempotency_storage_duration_ms", Unit::Milliseconds, "Idempotency storage latency in milliseconds");

    describe_counter!("retry_attempts_total", Unit::Count, "Operation attempts made by the retry executor");
    describe_histogram!("retry_delay_ms", Unit::Milliseconds, "Delay scheduled between retry attempts");
    describe_counter!("retry_outcomes_total", Unit::Count, "Retry executions by final outcome");
    describe_histogram!("retry_attempts_per_execution", Unit::Count, "Attempts used per retry execution");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    &METRICS
}
