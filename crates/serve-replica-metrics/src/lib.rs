//! Metrics aggregation for the replica execution core.
//!
//! A [`ReplicaMetricsManager`] owns the per-request counters and latency
//! histogram (exported through the `metrics` facade), the ongoing-requests
//! gauge, and the autoscaling push loop. Measures are written eagerly when
//! the export interval is zero, otherwise buffered in memory and flushed by a
//! periodic task. Exporter and controller failures are logged and retried
//! with exponential backoff; they never propagate to request handling.

pub mod controller;
pub mod manager;
pub mod pusher;
pub mod store;

pub use controller::{ControllerClient, ControllerError, NoopControllerClient};
pub use manager::{
    DEFAULT_LATENCY_BUCKETS_MS, ERROR_COUNTER, ONGOING_REQUESTS_GAUGE, PROCESSING_LATENCY,
    REQUEST_COUNTER, RESTART_COUNTER, ReplicaMetricsManager,
};
pub use pusher::MetricsPusher;
pub use store::InMemoryMetricsStore;
