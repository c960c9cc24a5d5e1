//! Environment toggles recognized by the replica core.
//!
//! All toggles are read once into a [`RuntimeEnv`] value so tests can inject
//! settings without touching the process environment.

use std::time::Duration;

/// Metrics export interval in milliseconds. `0` means eager (uncached) updates.
pub const METRICS_EXPORT_INTERVAL_MS: &str = "SERVE_REPLICA_METRICS_EXPORT_INTERVAL_MS";
/// When set, the replica does not push autoscaling metrics (the handle does).
pub const COLLECT_AUTOSCALING_METRICS_ON_HANDLE: &str =
    "SERVE_REPLICA_COLLECT_AUTOSCALING_METRICS_ON_HANDLE";
/// Upper bound in seconds on the local autoscaling sampling period.
pub const AUTOSCALING_METRIC_RECORD_PERIOD_S: &str =
    "SERVE_REPLICA_AUTOSCALING_METRIC_RECORD_PERIOD_S";
/// Ring-buffer size for the per-request access log tail.
pub const REQUEST_PATH_LOG_BUFFER_SIZE: &str = "SERVE_REPLICA_REQUEST_PATH_LOG_BUFFER_SIZE";
/// Enables offloading of blocking user methods to a worker-thread pool.
pub const RUN_SYNC_IN_THREADPOOL: &str = "SERVE_REPLICA_RUN_SYNC_IN_THREADPOOL";
/// Enables the two-loop model (user code on a dedicated event loop).
pub const RUN_USER_CODE_IN_SEPARATE_LOOP: &str = "SERVE_REPLICA_RUN_USER_CODE_IN_SEPARATE_LOOP";

/// Parsed environment toggles.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeEnv {
    pub metrics_export_interval: Duration,
    pub collect_autoscaling_metrics_on_handle: bool,
    pub autoscaling_metric_record_period: Duration,
    pub request_path_log_buffer_size: usize,
    pub run_sync_in_threadpool: bool,
    pub run_user_code_in_separate_loop: bool,
}

impl Default for RuntimeEnv {
    fn default() -> Self {
        Self {
            metrics_export_interval: Duration::ZERO,
            collect_autoscaling_metrics_on_handle: false,
            autoscaling_metric_record_period: Duration::from_millis(500),
            request_path_log_buffer_size: 100,
            run_sync_in_threadpool: false,
            run_user_code_in_separate_loop: true,
        }
    }
}

impl RuntimeEnv {
    /// Reads all toggles from the process environment, falling back to
    /// defaults for unset or unparseable values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            metrics_export_interval: env_u64(METRICS_EXPORT_INTERVAL_MS)
                .map(Duration::from_millis)
                .unwrap_or(defaults.metrics_export_interval),
            collect_autoscaling_metrics_on_handle: env_bool(COLLECT_AUTOSCALING_METRICS_ON_HANDLE)
                .unwrap_or(defaults.collect_autoscaling_metrics_on_handle),
            autoscaling_metric_record_period: env_f64(AUTOSCALING_METRIC_RECORD_PERIOD_S)
                .map(Duration::from_secs_f64)
                .unwrap_or(defaults.autoscaling_metric_record_period),
            request_path_log_buffer_size: env_u64(REQUEST_PATH_LOG_BUFFER_SIZE)
                .map(|n| n as usize)
                .unwrap_or(defaults.request_path_log_buffer_size),
            run_sync_in_threadpool: env_bool(RUN_SYNC_IN_THREADPOOL)
                .unwrap_or(defaults.run_sync_in_threadpool),
            run_user_code_in_separate_loop: env_bool(RUN_USER_CODE_IN_SEPARATE_LOOP)
                .unwrap_or(defaults.run_user_code_in_separate_loop),
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

fn env_f64(name: &str) -> Option<f64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

fn env_bool(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim() {
        "1" | "true" | "TRUE" | "True" => Some(true),
        "0" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}
