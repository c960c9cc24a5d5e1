//! Named periodic tasks for metric collection and controller pushes.

use crate::controller::ControllerError;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Longest backoff applied after consecutive task failures.
pub const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// A periodic task body. Failures trigger exponential backoff; success
/// resets it.
pub type PusherTaskFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<(), ControllerError>> + Send + Sync>;

/// Runs named periodic tasks on the plane loop.
///
/// Re-registering a name replaces the existing task, which is how reconfigure
/// updates intervals in place.
#[derive(Default)]
pub struct MetricsPusher {
    tasks: Mutex<HashMap<&'static str, JoinHandle<()>>>,
}

impl MetricsPusher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `task` firing every `interval`, replacing any task already
    /// registered under `name`.
    pub fn register_or_update_task(
        &self,
        name: &'static str,
        interval: Duration,
        task: PusherTaskFn,
    ) {
        let handle = tokio::spawn(run_periodic(name, interval, task));
        let mut tasks = lock(&self.tasks);
        if let Some(existing) = tasks.insert(name, handle) {
            existing.abort();
        }
    }

    /// Stops the task registered under `name`, if any.
    pub fn stop_task(&self, name: &'static str) {
        if let Some(handle) = lock(&self.tasks).remove(name) {
            handle.abort();
        }
    }

    /// Stops all registered tasks and waits for them to wind down.
    pub async fn graceful_shutdown(&self) {
        let handles: Vec<_> = lock(&self.tasks).drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn run_periodic(name: &'static str, interval: Duration, task: PusherTaskFn) {
    let mut consecutive_errors: u32 = 0;
    loop {
        tokio::time::sleep(interval).await;
        match task().await {
            Ok(()) => consecutive_errors = 0,
            Err(error) => {
                tracing::warn!(task = name, %error, "periodic metrics task failed");
                // Exponential backoff starting at 1s and capping at 10s.
                let backoff =
                    Duration::from_secs(1u64 << consecutive_errors.min(4)).min(MAX_BACKOFF);
                consecutive_errors = consecutive_errors.saturating_add(1);
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
