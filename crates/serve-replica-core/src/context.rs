//! Task-scoped context installed around user code.
//!
//! Two data are exposed to user code: the identity of the replica it is
//! running on ([`ReplicaContext`]) and the metadata of the request being
//! handled ([`RequestContext`]). Both are task-locals with an explicit
//! thread-local fallback so they propagate into worker threads running
//! blocking user methods. Neither is ever truly global mutable state.

use crate::config::DeploymentConfig;
use crate::id::ReplicaID;
use crate::metadata::{GrpcContext, RequestMetadata};
use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;

/// Callback handed to the HTTP path so the response status code can be
/// captured for access logs and metrics.
pub type StatusCodeCallback = Arc<dyn Fn(u16) + Send + Sync>;

/// Identity of the replica, visible to user code during any call.
#[derive(Debug, Clone)]
pub struct ReplicaContext {
    pub replica_id: ReplicaID,
    pub deployment_config: DeploymentConfig,
}

/// Per-request datum scoped around every user invocation.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub route: String,
    pub request_id: String,
    pub internal_request_id: String,
    pub app_name: String,
    pub multiplexed_model_id: String,
    pub grpc_context: Option<GrpcContext>,
}

impl RequestContext {
    pub fn from_metadata(metadata: &RequestMetadata, app_name: impl Into<String>) -> Self {
        Self {
            route: metadata.route.clone(),
            request_id: metadata.request_id.clone(),
            internal_request_id: metadata.internal_request_id.clone(),
            app_name: app_name.into(),
            multiplexed_model_id: metadata.multiplexed_model_id.clone(),
            grpc_context: metadata.grpc_context.clone(),
        }
    }
}

tokio::task_local! {
    static REQUEST_CONTEXT: RequestContext;
    static REPLICA_CONTEXT: Arc<ReplicaContext>;
}

thread_local! {
    static BLOCKING_REQUEST_CONTEXT: RefCell<Option<RequestContext>> = const { RefCell::new(None) };
    static BLOCKING_REPLICA_CONTEXT: RefCell<Option<Arc<ReplicaContext>>> = const { RefCell::new(None) };
}

/// Runs `f` with the request context installed for the duration of the future.
///
/// The context is released on every exit path, including cancellation.
pub async fn request_scope<F: Future>(context: RequestContext, f: F) -> F::Output {
    REQUEST_CONTEXT.scope(context, f).await
}

/// Runs `f` with the replica context installed for the duration of the future.
pub async fn replica_scope<F: Future>(context: Arc<ReplicaContext>, f: F) -> F::Output {
    REPLICA_CONTEXT.scope(context, f).await
}

/// Returns the request context of the current task or worker thread, if any.
pub fn current_request_context() -> Option<RequestContext> {
    REQUEST_CONTEXT
        .try_with(|context| context.clone())
        .ok()
        .or_else(|| BLOCKING_REQUEST_CONTEXT.with(|slot| slot.borrow().clone()))
}

/// Returns the replica context of the current task or worker thread, if any.
pub fn current_replica_context() -> Option<Arc<ReplicaContext>> {
    REPLICA_CONTEXT
        .try_with(Arc::clone)
        .ok()
        .or_else(|| BLOCKING_REPLICA_CONTEXT.with(|slot| slot.borrow().clone()))
}

/// Installs both contexts on the current worker thread, restoring the previous
/// values on drop. Used to propagate context into blocking user methods.
pub struct BlockingContextGuard {
    previous_request: Option<RequestContext>,
    previous_replica: Option<Arc<ReplicaContext>>,
}

impl BlockingContextGuard {
    pub fn enter(
        request: Option<RequestContext>,
        replica: Option<Arc<ReplicaContext>>,
    ) -> Self {
        let previous_request =
            BLOCKING_REQUEST_CONTEXT.with(|slot| slot.replace(request));
        let previous_replica =
            BLOCKING_REPLICA_CONTEXT.with(|slot| slot.replace(replica));
        Self {
            previous_request,
            previous_replica,
        }
    }
}

impl Drop for BlockingContextGuard {
    fn drop(&mut self) {
        BLOCKING_REQUEST_CONTEXT.with(|slot| {
            *slot.borrow_mut() = self.previous_request.take();
        });
        BLOCKING_REPLICA_CONTEXT.with(|slot| {
            *slot.borrow_mut() = self.previous_replica.take();
        });
    }
}
