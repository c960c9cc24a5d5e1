//! Component logger configuration and the access-log tail buffer.

use serve_replica_core::{LogEncoding, LoggingConfig};
use std::collections::VecDeque;
use std::sync::{Mutex, OnceLock};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

struct LoggingState {
    reload_handle: reload::Handle<EnvFilter, Registry>,
}

static LOGGING: OnceLock<LoggingState> = OnceLock::new();
static ACCESS_LOG: OnceLock<AccessLogBuffer> = OnceLock::new();
static LOG_FILE_PATH: Mutex<Option<String>> = Mutex::new(None);

/// Bounded ring buffer holding the most recent access-log lines.
pub struct AccessLogBuffer {
    capacity: usize,
    entries: Mutex<VecDeque<String>>,
}

impl AccessLogBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = lock(&self.entries);
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(line);
    }

    fn tail(&self) -> Vec<String> {
        lock(&self.entries).iter().cloned().collect()
    }
}

/// Configures the component logger for this replica.
///
/// The first call installs the global subscriber (a no-op if one is already
/// installed, e.g. under a test harness) and sizes the access-log tail
/// buffer; later calls only update the filter, which is how `logging_config`
/// changes apply without a restart. Returns the advertised log file path, if
/// the config names a logs directory.
pub fn configure_component_logger(
    component_name: &str,
    component_id: &str,
    config: &LoggingConfig,
    buffer_size: usize,
) -> Option<String> {
    let _ = ACCESS_LOG.get_or_init(|| AccessLogBuffer::new(buffer_size));

    if let Some(state) = LOGGING.get() {
        let filter = EnvFilter::new(&config.log_level);
        if let Err(error) = state.reload_handle.reload(filter) {
            tracing::warn!(%error, "failed to reload log filter");
        }
    } else {
        let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(&config.log_level));
        let initialized = match config.encoding {
            LogEncoding::Json => tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init(),
            LogEncoding::Text => tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init(),
        };
        // A pre-existing global subscriber (common in tests) keeps logging
        // functional; only the reload handle is lost in that case.
        if initialized.is_ok() {
            let _ = LOGGING.set(LoggingState { reload_handle });
        }
    }

    let log_file_path = config
        .logs_dir
        .as_ref()
        .map(|dir| format!("{dir}/replica_{component_name}_{component_id}.log"));
    *lock(&LOG_FILE_PATH) = log_file_path.clone();
    log_file_path
}

/// The log file path advertised by the most recent logger configuration.
pub fn component_log_file_path() -> Option<String> {
    lock(&LOG_FILE_PATH).clone()
}

/// Formats one access-log line.
pub fn access_log_msg(method: &str, route: &str, status: &str, latency_ms: f64) -> String {
    format!("{method} {route} {status} {latency_ms:.1}ms")
}

/// Appends a line to the access-log tail buffer.
pub fn record_access_log(line: String) {
    if let Some(buffer) = ACCESS_LOG.get() {
        buffer.push(line);
    }
}

/// The buffered access-log tail, oldest first.
pub fn access_log_tail() -> Vec<String> {
    ACCESS_LOG.get().map(|buffer| buffer.tail()).unwrap_or_default()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
