//! Per-replica metrics aggregation.

use crate::controller::ControllerClient;
use crate::pusher::MetricsPusher;
use crate::store::InMemoryMetricsStore;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use serve_replica_core::{AutoscalingConfig, ReplicaID, RuntimeEnv};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

/// Name of the counter incremented exactly once at replica construction.
pub const RESTART_COUNTER: &str = "replica_starts_total";
/// Requests processed successfully, tagged by route.
pub const REQUEST_COUNTER: &str = "replica_request_total";
/// Requests that ended in an error, tagged by route.
pub const ERROR_COUNTER: &str = "replica_error_total";
/// Processing latency histogram in milliseconds, tagged by route.
pub const PROCESSING_LATENCY: &str = "replica_processing_latency_ms";
/// Current number of ongoing requests (untagged gauge).
pub const ONGOING_REQUESTS_GAUGE: &str = "replica_processing_requests";

/// Fixed latency bucket boundaries in milliseconds.
pub const DEFAULT_LATENCY_BUCKETS_MS: &[f64] = &[
    1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0,
    30000.0, 60000.0, 120000.0, 300000.0, 600000.0,
];

const PUSH_METRICS_TO_CONTROLLER_TASK_NAME: &str = "push_metrics_to_controller";
const RECORD_METRICS_TASK_NAME: &str = "record_metrics";

#[derive(Default)]
struct CachedMetrics {
    requests: HashMap<String, u64>,
    errors: HashMap<String, u64>,
    latencies: HashMap<String, Vec<f64>>,
}

/// Manages metrics for the replica.
///
/// Fine-grained per-request measures are either written eagerly or buffered
/// in memory and flushed by a periodic task, depending on the configured
/// export interval. When autoscaling is enabled and handle-side collection is
/// disabled, load samples are recorded locally and a windowed average is
/// pushed to the controller periodically.
pub struct ReplicaMetricsManager {
    // Set once right after construction; periodic task closures hold weak
    // references so they never keep the manager alive.
    weak_self: std::sync::OnceLock<Weak<ReplicaMetricsManager>>,
    replica_id: ReplicaID,
    controller: Arc<dyn ControllerClient>,
    autoscaling_config: Mutex<Option<AutoscalingConfig>>,
    collect_on_handle: bool,
    record_period: Duration,
    num_ongoing_requests: AtomicUsize,
    cached_interval: Duration,
    cached: Mutex<CachedMetrics>,
    store: Mutex<InMemoryMetricsStore>,
    pusher: MetricsPusher,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicaMetricsManager {
    /// Creates the manager and starts its background tasks.
    ///
    /// Must be called within a tokio runtime (the plane loop). Increments the
    /// restart counter exactly once.
    pub fn new(
        replica_id: ReplicaID,
        autoscaling_config: Option<AutoscalingConfig>,
        controller: Arc<dyn ControllerClient>,
        env: &RuntimeEnv,
    ) -> Arc<Self> {
        describe_counter!(
            RESTART_COUNTER,
            "The number of times this replica has been restarted due to failure."
        );
        describe_counter!(
            REQUEST_COUNTER,
            "The number of requests that have been processed in this replica."
        );
        describe_counter!(
            ERROR_COUNTER,
            "The number of errors that have occurred in this replica."
        );
        describe_histogram!(PROCESSING_LATENCY, "The latency for requests to be processed.");
        describe_gauge!(
            ONGOING_REQUESTS_GAUGE,
            "The current number of requests being processed."
        );

        counter!(RESTART_COUNTER).increment(1);

        let manager = Arc::new(Self {
            weak_self: std::sync::OnceLock::new(),
            replica_id,
            controller,
            autoscaling_config: Mutex::new(None),
            collect_on_handle: env.collect_autoscaling_metrics_on_handle,
            record_period: env.autoscaling_metric_record_period,
            num_ongoing_requests: AtomicUsize::new(0),
            cached_interval: env.metrics_export_interval,
            cached: Mutex::new(CachedMetrics::default()),
            store: Mutex::new(InMemoryMetricsStore::new()),
            pusher: MetricsPusher::new(),
            flush_task: Mutex::new(None),
        });

        let _ = manager.weak_self.set(Arc::downgrade(&manager));

        if manager.cached_metrics_enabled() {
            let weak = Arc::downgrade(&manager);
            let interval = manager.cached_interval;
            *lock(&manager.flush_task) = Some(tokio::spawn(report_cached_metrics_forever(
                weak, interval,
            )));
        }

        manager.set_autoscaling_config(autoscaling_config);
        manager
    }

    fn cached_metrics_enabled(&self) -> bool {
        !self.cached_interval.is_zero()
    }

    /// True iff this replica is responsible for pushing autoscaling metrics.
    pub fn should_collect_metrics(&self) -> bool {
        !self.collect_on_handle && lock(&self.autoscaling_config).is_some()
    }

    /// Dynamically updates the autoscaling config, starting, retiming, or
    /// stopping the periodic collection tasks as needed.
    pub fn set_autoscaling_config(&self, config: Option<AutoscalingConfig>) {
        *lock(&self.autoscaling_config) = config.clone();

        let Some(config) = config else {
            self.pusher.stop_task(PUSH_METRICS_TO_CONTROLLER_TASK_NAME);
            self.pusher.stop_task(RECORD_METRICS_TASK_NAME);
            return;
        };
        if self.collect_on_handle {
            return;
        }
        let Some(weak_self) = self.weak_self.get() else {
            return;
        };

        // Push autoscaling metrics to the controller periodically.
        let weak = Weak::clone(weak_self);
        self.pusher.register_or_update_task(
            PUSH_METRICS_TO_CONTROLLER_TASK_NAME,
            config.metrics_interval_s,
            Arc::new(move || {
                let weak = Weak::clone(&weak);
                Box::pin(async move {
                    if let Some(manager) = weak.upgrade() {
                        manager.push_autoscaling_metrics().await?;
                    }
                    Ok(())
                })
            }),
        );

        // Collect autoscaling metrics locally periodically.
        let weak = Weak::clone(weak_self);
        self.pusher.register_or_update_task(
            RECORD_METRICS_TASK_NAME,
            self.record_period.min(config.metrics_interval_s),
            Arc::new(move || {
                let weak = Weak::clone(&weak);
                Box::pin(async move {
                    if let Some(manager) = weak.upgrade() {
                        manager.add_autoscaling_metrics_point();
                    }
                    Ok(())
                })
            }),
        );
    }

    /// Increments the ongoing-request count, returning the new value.
    pub fn inc_num_ongoing_requests(&self) -> usize {
        let current = self.num_ongoing_requests.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.cached_metrics_enabled() {
            gauge!(ONGOING_REQUESTS_GAUGE).set(current as f64);
        }
        current
    }

    /// Decrements the ongoing-request count, returning the new value.
    pub fn dec_num_ongoing_requests(&self) -> usize {
        let current = self.num_ongoing_requests.fetch_sub(1, Ordering::SeqCst) - 1;
        if !self.cached_metrics_enabled() {
            gauge!(ONGOING_REQUESTS_GAUGE).set(current as f64);
        }
        current
    }

    /// Current ongoing-request count. Never blocks on user code.
    pub fn get_num_ongoing_requests(&self) -> usize {
        self.num_ongoing_requests.load(Ordering::SeqCst)
    }

    /// Records per-request measures for one finished request.
    pub fn record_request_metrics(&self, route: &str, latency_ms: f64, was_error: bool) {
        if self.cached_metrics_enabled() {
            let mut cached = lock(&self.cached);
            cached
                .latencies
                .entry(route.to_string())
                .or_default()
                .push(latency_ms);
            if was_error {
                *cached.errors.entry(route.to_string()).or_default() += 1;
            } else {
                *cached.requests.entry(route.to_string()).or_default() += 1;
            }
        } else {
            histogram!(PROCESSING_LATENCY, "route" => route.to_string()).record(latency_ms);
            if was_error {
                counter!(ERROR_COUNTER, "route" => route.to_string()).increment(1);
            } else {
                counter!(REQUEST_COUNTER, "route" => route.to_string()).increment(1);
            }
        }
    }

    /// Flushes the buffered measures to the exporter in bulk.
    pub fn report_cached_metrics(&self) {
        let drained = {
            let mut cached = lock(&self.cached);
            std::mem::take(&mut *cached)
        };

        for (route, count) in drained.requests {
            counter!(REQUEST_COUNTER, "route" => route).increment(count);
        }
        for (route, count) in drained.errors {
            counter!(ERROR_COUNTER, "route" => route).increment(count);
        }
        for (route, latencies) in drained.latencies {
            let histogram = histogram!(PROCESSING_LATENCY, "route" => route);
            for latency_ms in latencies {
                histogram.record(latency_ms);
            }
        }

        gauge!(ONGOING_REQUESTS_GAUGE).set(self.get_num_ongoing_requests() as f64);
    }

    /// Stops the periodic background tasks, flushing buffered measures once.
    pub async fn shutdown(&self) {
        let task = lock(&self.flush_task).take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.pusher.graceful_shutdown().await;
        if self.cached_metrics_enabled() {
            self.report_cached_metrics();
        }
    }

    async fn push_autoscaling_metrics(&self) -> Result<(), crate::controller::ControllerError> {
        let Some(config) = lock(&self.autoscaling_config).clone() else {
            return Ok(());
        };
        let now = now_s();
        let window_start = now - config.look_back_period_s.as_secs_f64();
        let window_avg = lock(&self.store).window_average(window_start);
        self.controller
            .record_autoscaling_metrics(self.replica_id.clone(), window_avg, now)
            .await
    }

    fn add_autoscaling_metrics_point(&self) {
        lock(&self.store).add_metrics_point(self.get_num_ongoing_requests() as f64, now_s());
    }
}

async fn report_cached_metrics_forever(manager: Weak<ReplicaMetricsManager>, interval: Duration) {
    let mut consecutive_errors: u32 = 0;
    loop {
        tokio::time::sleep(interval).await;
        let Some(manager) = manager.upgrade() else {
            break;
        };
        // Flushing only touches in-memory maps and the exporter facade; a
        // panicking exporter must not kill the flush loop.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            manager.report_cached_metrics();
        }));
        match result {
            Ok(()) => consecutive_errors = 0,
            Err(_) => {
                tracing::error!("unexpected error reporting metrics");
                let backoff = Duration::from_secs(1u64 << consecutive_errors.min(4))
                    .min(crate::pusher::MAX_BACKOFF);
                consecutive_errors = consecutive_errors.saturating_add(1);
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

fn now_s() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{ControllerError, NoopControllerClient};
    use futures::future::BoxFuture;
    use serve_replica_core::DeploymentID;

    fn test_replica_id() -> ReplicaID {
        ReplicaID::new(DeploymentID::new("app", "model"), "r1")
    }

    fn eager_env() -> RuntimeEnv {
        RuntimeEnv::default()
    }

    #[tokio::test]
    async fn ongoing_request_counting() {
        let manager = ReplicaMetricsManager::new(
            test_replica_id(),
            None,
            Arc::new(NoopControllerClient),
            &eager_env(),
        );

        assert_eq!(manager.get_num_ongoing_requests(), 0);
        assert_eq!(manager.inc_num_ongoing_requests(), 1);
        assert_eq!(manager.inc_num_ongoing_requests(), 2);
        assert_eq!(manager.dec_num_ongoing_requests(), 1);
        assert_eq!(manager.dec_num_ongoing_requests(), 0);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn should_collect_metrics_requires_autoscaling_config() {
        let manager = ReplicaMetricsManager::new(
            test_replica_id(),
            None,
            Arc::new(NoopControllerClient),
            &eager_env(),
        );
        assert!(!manager.should_collect_metrics());

        manager.set_autoscaling_config(Some(AutoscalingConfig::new(
            Duration::from_secs(10),
            Duration::from_secs(30),
        )));
        assert!(manager.should_collect_metrics());

        manager.set_autoscaling_config(None);
        assert!(!manager.should_collect_metrics());
        manager.shutdown().await;
    }

    struct RecordingController {
        pushes: Arc<Mutex<Vec<Option<f64>>>>,
    }

    impl ControllerClient for RecordingController {
        fn record_autoscaling_metrics(
            &self,
            _replica_id: ReplicaID,
            window_avg: Option<f64>,
            _send_timestamp_s: f64,
        ) -> BoxFuture<'static, Result<(), ControllerError>> {
            let pushes = Arc::clone(&self.pushes);
            Box::pin(async move {
                lock(&pushes).push(window_avg);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn pushes_windowed_average_to_controller() {
        let pushes = Arc::new(Mutex::new(Vec::new()));
        let controller = Arc::new(RecordingController {
            pushes: Arc::clone(&pushes),
        });

        let mut env = eager_env();
        env.autoscaling_metric_record_period = Duration::from_millis(5);
        let manager = ReplicaMetricsManager::new(
            test_replica_id(),
            Some(AutoscalingConfig::new(
                Duration::from_millis(20),
                Duration::from_secs(10),
            )),
            controller,
            &env,
        );

        manager.inc_num_ongoing_requests();
        manager.inc_num_ongoing_requests();
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.shutdown().await;

        let pushes = lock(&pushes);
        assert!(!pushes.is_empty());
        assert!(pushes.iter().any(|avg| avg.is_some()));
        let last = pushes.last().cloned().flatten();
        assert!(last.is_some_and(|avg| avg > 0.0 && avg <= 2.0));
    }
}
