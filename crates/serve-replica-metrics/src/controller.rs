//! Outbound controller RPC seam.

use futures::future::BoxFuture;
use serve_replica_core::ReplicaID;

/// Failure reported by a controller push.
#[derive(Debug, Clone, thiserror::Error)]
#[error("controller push failed: {message}")]
pub struct ControllerError {
    pub message: String,
}

impl ControllerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Client for the control plane's autoscaling-metrics endpoint.
///
/// Pushes are fire-and-forget from the replica's perspective: failures are
/// logged and retried with backoff, never surfaced to request handling.
pub trait ControllerClient: Send + Sync + 'static {
    fn record_autoscaling_metrics(
        &self,
        replica_id: ReplicaID,
        window_avg: Option<f64>,
        send_timestamp_s: f64,
    ) -> BoxFuture<'static, Result<(), ControllerError>>;
}

/// Controller client that drops every push. Used when no controller is
/// attached (e.g. deterministic tests without autoscaling assertions).
#[derive(Debug, Clone, Default)]
pub struct NoopControllerClient;

impl ControllerClient for NoopControllerClient {
    fn record_autoscaling_metrics(
        &self,
        _replica_id: ReplicaID,
        _window_avg: Option<f64>,
        _send_timestamp_s: f64,
    ) -> BoxFuture<'static, Result<(), ControllerError>> {
        Box::pin(async { Ok(()) })
    }
}
