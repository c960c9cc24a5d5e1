//! Execution placements for user code.
//!
//! In the default placement all user code runs on a dedicated
//! current-thread runtime on its own OS thread, so a long or CPU-bound user
//! operation cannot starve health checks, metrics, or cancellation handling
//! on the plane loop. The shared placement runs user code inline on the
//! plane runtime and exists for deterministic testing.

use pin_project_lite::pin_project;
use serve_replica_admission::AdmissionSemaphore;
use serve_replica_core::context::{self, BlockingContextGuard, ReplicaContext, RequestContext};
use serve_replica_core::{ReplicaError, UserError};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};
use tokio::task::JoinError;
use tokio_util::task::AbortOnDropHandle;

/// Which loop runs user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// User code runs on a dedicated event loop on its own OS thread.
    SeparateUserLoop,
    /// User code runs inline on the plane's event loop.
    SharedLoop,
}

/// Dedicated single-threaded runtime hosting all user code.
struct UserCodeRuntime {
    handle: tokio::runtime::Handle,
    shutdown: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl UserCodeRuntime {
    fn start() -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        // The loop thread parks in block_on until shutdown is signalled;
        // spawned user tasks run on it in the meantime. The thread is
        // detached, mirroring a daemon thread: pending tasks are dropped
        // when the runtime is.
        std::thread::Builder::new()
            .name("serve-user-loop".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let _ = shutdown_rx.await;
                });
            })?;

        Ok(Self {
            handle,
            shutdown: Mutex::new(Some(shutdown_tx)),
        })
    }

    fn shutdown(&self) {
        let sender = match self.shutdown.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }
}

enum LoopHandle {
    Separate(UserCodeRuntime),
    Shared(tokio::runtime::Handle),
}

/// Schedules user code onto its configured loop and worker-thread pool.
pub struct UserCodeExecutor {
    loop_handle: LoopHandle,
    run_sync_in_threadpool: bool,
    sync_limit: Arc<AtomicUsize>,
    sync_limiter: AdmissionSemaphore,
    replica_context: RwLock<Option<Arc<ReplicaContext>>>,
}

impl UserCodeExecutor {
    /// Creates the executor.
    ///
    /// Must be called within a tokio runtime: the shared placement captures
    /// the current handle, and the separate placement spawns the user loop
    /// thread.
    pub fn new(
        mode: ExecutionMode,
        run_sync_in_threadpool: bool,
        initial_sync_limit: usize,
    ) -> std::io::Result<Self> {
        let loop_handle = match mode {
            ExecutionMode::SeparateUserLoop => LoopHandle::Separate(UserCodeRuntime::start()?),
            ExecutionMode::SharedLoop => LoopHandle::Shared(tokio::runtime::Handle::current()),
        };
        let sync_limit = Arc::new(AtomicUsize::new(initial_sync_limit.max(1)));
        let accessor = Arc::clone(&sync_limit);
        Ok(Self {
            loop_handle,
            run_sync_in_threadpool,
            sync_limit,
            sync_limiter: AdmissionSemaphore::new(Arc::new(move || {
                accessor.load(Ordering::SeqCst)
            })),
            replica_context: RwLock::new(None),
        })
    }

    pub fn mode(&self) -> ExecutionMode {
        match self.loop_handle {
            LoopHandle::Separate(_) => ExecutionMode::SeparateUserLoop,
            LoopHandle::Shared(_) => ExecutionMode::SharedLoop,
        }
    }

    pub fn run_sync_in_threadpool(&self) -> bool {
        self.run_sync_in_threadpool
    }

    /// Installs the replica context scoped around subsequent user calls.
    pub fn set_replica_context(&self, replica_context: Arc<ReplicaContext>) {
        if let Ok(mut slot) = self.replica_context.write() {
            *slot = Some(replica_context);
        }
    }

    fn replica_context(&self) -> Option<Arc<ReplicaContext>> {
        self.replica_context.read().ok().and_then(|slot| slot.clone())
    }

    /// Resizes the worker-thread pool used for blocking methods.
    ///
    /// The limit tracks `max_ongoing_requests` and applies to acquisitions
    /// from this point on; threads already running are unaffected.
    pub fn set_sync_method_limit(&self, limit: usize) {
        self.sync_limit.store(limit.max(1), Ordering::SeqCst);
        self.sync_limiter.notify_capacity_changed();
    }

    fn user_handle(&self) -> &tokio::runtime::Handle {
        match &self.loop_handle {
            LoopHandle::Separate(runtime) => &runtime.handle,
            LoopHandle::Shared(handle) => handle,
        }
    }

    /// Spawns `future` onto the user loop with the request and replica
    /// contexts installed, returning a bridge future for the plane to await.
    pub fn spawn_user<F>(
        &self,
        request_context: Option<RequestContext>,
        future: F,
    ) -> UserTask<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let replica_context = self.replica_context();
        let wrapped = async move {
            match (replica_context, request_context) {
                (Some(replica), Some(request)) => {
                    context::replica_scope(replica, context::request_scope(request, future)).await
                }
                (Some(replica), None) => context::replica_scope(replica, future).await,
                (None, Some(request)) => context::request_scope(request, future).await,
                (None, None) => future.await,
            }
        };
        UserTask {
            inner: AbortOnDropHandle::new(self.user_handle().spawn(wrapped)),
        }
    }

    /// Runs a blocking closure on the user runtime's worker-thread pool,
    /// gated by the sync-method limiter and with both contexts propagated to
    /// the worker thread.
    pub async fn run_blocking<F, T>(
        &self,
        request_context: Option<RequestContext>,
        f: F,
    ) -> Result<T, ReplicaError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self.sync_limiter.acquire().await;
        let replica_context = self.replica_context();
        let task = self.user_handle().spawn_blocking(move || {
            let _guard = BlockingContextGuard::enter(request_context, replica_context);
            f()
        });
        task.await.map_err(join_error_to_replica_error)
    }

    /// Stops the dedicated user loop, if one was started. Pending tasks are
    /// dropped.
    pub fn shutdown(&self) {
        if let LoopHandle::Separate(runtime) = &self.loop_handle {
            runtime.shutdown();
        }
    }
}

pin_project! {
    /// Future bridging a user-loop task back to the plane loop.
    ///
    /// Dropping it aborts the task; user code observes the abort at its next
    /// suspension point. Blocking code already running is not terminated.
    pub struct UserTask<T> {
        #[pin]
        inner: AbortOnDropHandle<T>,
    }
}

impl<T> Future for UserTask<T> {
    type Output = Result<T, ReplicaError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.inner.poll(cx) {
            Poll::Ready(Ok(value)) => Poll::Ready(Ok(value)),
            Poll::Ready(Err(join_error)) => {
                Poll::Ready(Err(join_error_to_replica_error(join_error)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

fn join_error_to_replica_error(join_error: JoinError) -> ReplicaError {
    if join_error.is_cancelled() {
        ReplicaError::Cancelled
    } else {
        ReplicaError::User(UserError::failed(format!(
            "user code panicked: {join_error}"
        )))
    }
}
