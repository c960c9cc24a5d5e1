//! The user callable wrapper: the only place that touches user code.

use crate::deployment::{
    Deployment, DeploymentFactory, Emitter, MethodKind, UserMethod, UserMethodInfo, UserRequest,
    UserValue,
};
use crate::executor::{ExecutionMode, UserCodeExecutor, UserTask};
use crate::http::{AsgiReceive, AsgiSend, HttpMessage, HttpRequest, HttpResponse, HttpScope};
use crate::queue::MessageQueue;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use serve_replica_core::context::{self, ReplicaContext, RequestContext};
use serve_replica_core::{
    DeploymentID, ReplicaError, RequestMetadata, StatusCodeCallback, UserError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Read-only facts about the deployment's ASGI app, surfaced at
/// initialization for route matching and metadata reporting.
#[derive(Debug, Clone)]
pub struct AsgiAppInfo {
    pub routes: Vec<String>,
    pub docs_path: Option<String>,
}

/// Owns the user deployment's lifecycle and dispatches every call into it.
///
/// The deployment is constructed exactly once per replica lifetime, on the
/// user loop; the destructor runs at most once. All request dispatch goes
/// through the configured [`UserCodeExecutor`] so user code never runs on the
/// plane loop in the separate-loop placement.
pub struct UserCallableWrapper {
    deployment_id: DeploymentID,
    factory: Mutex<Option<DeploymentFactory>>,
    callable: OnceLock<Arc<Deployment>>,
    executor: Arc<UserCodeExecutor>,
    destructor_called: AtomicBool,
    warned_inline_sync: AtomicBool,
}

impl UserCallableWrapper {
    pub fn new(
        deployment_id: DeploymentID,
        factory: DeploymentFactory,
        mode: ExecutionMode,
        run_sync_in_threadpool: bool,
        initial_sync_limit: usize,
    ) -> Result<Self, ReplicaError> {
        let executor = UserCodeExecutor::new(mode, run_sync_in_threadpool, initial_sync_limit)
            .map_err(|error| ReplicaError::Initialization {
                message: format!("failed to start the user code loop: {error}"),
            })?;
        Ok(Self {
            deployment_id,
            factory: Mutex::new(Some(factory)),
            callable: OnceLock::new(),
            executor: Arc::new(executor),
            destructor_called: AtomicBool::new(false),
            warned_inline_sync: AtomicBool::new(false),
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.callable.get().is_some()
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.executor.mode()
    }

    /// Installs the replica context scoped around subsequent user calls.
    pub fn set_replica_context(&self, replica_context: Arc<ReplicaContext>) {
        self.executor.set_replica_context(replica_context);
    }

    /// Resizes the worker-thread pool for blocking methods.
    pub fn set_sync_method_threadpool_limit(&self, limit: usize) {
        self.executor.set_sync_method_limit(limit);
    }

    fn callable(&self, operation: &str) -> Result<Arc<Deployment>, ReplicaError> {
        self.callable
            .get()
            .cloned()
            .ok_or_else(|| ReplicaError::NotInitialized {
                operation: operation.to_string(),
            })
    }

    fn request_context(&self, metadata: &RequestMetadata) -> Option<RequestContext> {
        Some(RequestContext::from_metadata(
            metadata,
            self.deployment_id.app_name.clone(),
        ))
    }

    fn warn_inline_sync(&self, method: &str) {
        if !self.warned_inline_sync.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                method,
                "blocking method runs inline on the user event loop; enable the \
                 threadpool toggle to offload it to a worker thread"
            );
        }
    }

    /// Constructs the user deployment on the user loop.
    ///
    /// Returns the ASGI app facts if the deployment is an ASGI app. Calling
    /// this more than once is an initialization error.
    pub async fn initialize_callable(&self) -> Result<Option<AsgiAppInfo>, ReplicaError> {
        let factory = lock(&self.factory).take();
        let Some(factory) = factory else {
            return Err(ReplicaError::Initialization {
                message: "initialize_callable should only be called once".to_string(),
            });
        };

        tracing::info!("started initializing replica");
        let deployment: Deployment =
            flatten(self.executor.spawn_user(None, async move { factory().await })).await?;
        let asgi_info = deployment.asgi().map(|app| AsgiAppInfo {
            routes: app.routes.clone(),
            docs_path: app.docs_path.clone(),
        });
        if self.callable.set(Arc::new(deployment)).is_err() {
            return Err(ReplicaError::Initialization {
                message: "initialize_callable should only be called once".to_string(),
            });
        }
        tracing::info!("finished initializing replica");
        Ok(asgi_info)
    }

    /// Classification of the named method.
    pub fn user_method_info(&self, method: &str) -> Result<UserMethodInfo, ReplicaError> {
        self.callable("user_method_info")?.method_info(method)
    }

    /// Invokes the user's reconfigure hook with the new config, if one was
    /// supplied.
    pub async fn call_reconfigure(&self, user_config: Option<Value>) -> Result<(), ReplicaError> {
        let deployment = self.callable("call_reconfigure")?;
        let Some(user_config) = user_config else {
            return Ok(());
        };
        let Some(hook) = deployment.reconfigure_hook() else {
            return Err(ReplicaError::MissingReconfigureHook {
                deployment: self.deployment_id.to_string(),
            });
        };
        flatten(
            self.executor
                .spawn_user(None, async move { hook(user_config).await }),
        )
        .await
    }

    /// Starts the user health check on the user loop.
    ///
    /// Returns `None` when the deployment has no health check hook, in which
    /// case the user loop is not touched at all. This keeps basic health
    /// checks responsive even when user code has the loop blocked.
    pub fn call_user_health_check(
        &self,
    ) -> Result<Option<UserTask<Result<(), UserError>>>, ReplicaError> {
        let deployment = self.callable("call_user_health_check")?;
        Ok(deployment.health_check_hook().map(|hook| {
            self.executor
                .spawn_user(None, async move { hook().await })
        }))
    }

    /// Starts the user routing-stats hook on the user loop, if present.
    pub fn call_user_record_routing_stats(
        &self,
    ) -> Result<Option<UserTask<Result<serde_json::Map<String, Value>, UserError>>>, ReplicaError>
    {
        let deployment = self.callable("call_user_record_routing_stats")?;
        Ok(deployment.record_routing_stats_hook().map(|hook| {
            self.executor
                .spawn_user(None, async move { hook().await })
        }))
    }

    /// Calls a unary user method and returns its result.
    pub async fn call_user_method(
        &self,
        metadata: &RequestMetadata,
        request: UserRequest,
    ) -> Result<UserValue, ReplicaError> {
        let deployment = self.callable("call_user_method")?;
        let info = deployment.method_info(&metadata.call_method)?;
        tracing::info!(method = %info.name, "started executing request");

        let request_context = self.request_context(metadata);
        let Some(entry) = deployment.entry(&metadata.call_method) else {
            return Err(ReplicaError::AsgiMethodOutsideHttp { method: info.name });
        };
        match &entry.method {
            UserMethod::AsyncStream(_) | UserMethod::BlockingStream(_) => {
                Err(ReplicaError::StreamFromUnary { method: info.name })
            }
            UserMethod::Async(f) => {
                let f = Arc::clone(f);
                flatten(
                    self.executor
                        .spawn_user(request_context, async move { f(request).await }),
                )
                .await
            }
            UserMethod::Blocking(f) => {
                let f = Arc::clone(f);
                if self.executor.run_sync_in_threadpool() {
                    self.executor
                        .run_blocking(request_context, move || f(request))
                        .await?
                        .map_err(ReplicaError::from)
                } else {
                    self.warn_inline_sync(&info.name);
                    flatten(
                        self.executor
                            .spawn_user(request_context, async move { f(request) }),
                    )
                    .await
                }
            }
        }
    }

    /// Calls a streaming user method, yielding its results in order.
    ///
    /// Misuse (a unary method, or an ASGI app outside HTTP) is reported
    /// before any user code runs.
    pub fn call_user_generator(
        &self,
        metadata: &RequestMetadata,
        request: UserRequest,
    ) -> Result<BoxStream<'static, Result<UserValue, ReplicaError>>, ReplicaError> {
        let deployment = self.callable("call_user_generator")?;
        let info = deployment.method_info(&metadata.call_method)?;
        tracing::info!(method = %info.name, "started executing request");

        let request_context = self.request_context(metadata);
        let Some(entry) = deployment.entry(&metadata.call_method) else {
            return Err(ReplicaError::AsgiMethodOutsideHttp { method: info.name });
        };

        let queue: MessageQueue<UserValue> = MessageQueue::new();
        let completion: BoxFuture<'static, Result<(), ReplicaError>> = match &entry.method {
            UserMethod::Async(_) | UserMethod::Blocking(_) => {
                return Err(ReplicaError::UnaryFromStream { method: info.name });
            }
            UserMethod::AsyncStream(f) => {
                let f = Arc::clone(f);
                let producer = queue.clone();
                let task: UserTask<Result<(), UserError>> =
                    self.executor.spawn_user(request_context, async move {
                        let mut stream = f(request);
                        while let Some(item) = stream.next().await {
                            producer.put_nowait(item?);
                        }
                        Ok(())
                    });
                Box::pin(flatten(task))
            }
            UserMethod::BlockingStream(f) => {
                let f = Arc::clone(f);
                let producer = queue.clone();
                let emitter = Emitter::new(move |value| producer.put_nowait(value));
                if self.executor.run_sync_in_threadpool() {
                    let executor = Arc::clone(&self.executor);
                    Box::pin(async move {
                        executor
                            .run_blocking(request_context, move || f(request, emitter))
                            .await?
                            .map_err(ReplicaError::from)
                    })
                } else {
                    self.warn_inline_sync(&info.name);
                    let task = self
                        .executor
                        .spawn_user(request_context, async move { f(request, emitter) });
                    Box::pin(flatten(task))
                }
            }
        };

        let items = queue
            .fetch_messages_from_queue(completion)
            .flat_map(|result| match result {
                Ok(batch) => futures::stream::iter(batch.into_iter().map(Ok)).boxed(),
                Err(error) => futures::stream::once(async move { Err(error) }).boxed(),
            });
        Ok(items.boxed())
    }

    /// Calls an HTTP entrypoint, yielding its response messages in
    /// micro-batches.
    ///
    /// The first `ResponseStart` message is peeked to report the status code
    /// through `status_code_callback`.
    pub fn call_http_entrypoint(
        &self,
        metadata: &RequestMetadata,
        status_code_callback: StatusCodeCallback,
        scope: HttpScope,
        receive: AsgiReceive,
    ) -> Result<BoxStream<'static, Result<Vec<HttpMessage>, ReplicaError>>, ReplicaError> {
        let deployment = self.callable("call_http_entrypoint")?;
        let info = deployment.method_info(&metadata.call_method)?;
        tracing::info!(method = %info.name, "started executing request");

        let request_context = self.request_context(metadata);
        let queue: MessageQueue<HttpMessage> = MessageQueue::new();
        let send: AsgiSend = {
            let producer = queue.clone();
            Arc::new(move |message| producer.put_nowait(message))
        };

        let user_future: BoxFuture<'static, Result<(), UserError>> =
            if info.kind == MethodKind::Asgi {
                let Some(app) = deployment.asgi() else {
                    return Err(ReplicaError::AsgiMethodOutsideHttp { method: info.name });
                };
                let handler = Arc::clone(&app.handler);
                let probe = queue.clone();
                let send = Arc::clone(&send);
                Box::pin(async move {
                    match handler(scope, receive, Arc::clone(&send)).await {
                        Ok(()) => Ok(()),
                        Err(error) => {
                            // If the app died before sending anything, surface
                            // the failure as an HTTP error response so the
                            // client is not left hanging.
                            if probe.is_empty() {
                                for message in error_response(&error).messages() {
                                    send(message);
                                }
                            }
                            Err(error)
                        }
                    }
                })
            } else {
                let Some(entry) = deployment.entry(&metadata.call_method) else {
                    return Err(ReplicaError::MethodNotFound {
                        method: metadata.call_method.clone(),
                        available: deployment.method_names(),
                    });
                };
                self.http_method_future(entry, &info, scope, receive, Arc::clone(&send))
            };

        let completion = flatten(self.executor.spawn_user(request_context, user_future));
        let batches = queue.fetch_messages_from_queue(completion);

        let mut peeked = false;
        let stream = batches.map(move |result| {
            if !peeked {
                if let Ok(batch) = &result {
                    if let Some(first) = batch.first() {
                        peeked = true;
                        if let HttpMessage::ResponseStart { status, .. } = first {
                            status_code_callback(*status);
                        }
                    }
                }
            }
            result
        });
        Ok(stream.boxed())
    }

    /// Builds the user-loop future for a non-ASGI HTTP handler.
    fn http_method_future(
        &self,
        entry: &crate::deployment::MethodEntry,
        info: &UserMethodInfo,
        scope: HttpScope,
        receive: AsgiReceive,
        send: AsgiSend,
    ) -> BoxFuture<'static, Result<(), UserError>> {
        let request = if info.takes_request {
            UserRequest::Http(HttpRequest::new(scope, receive))
        } else {
            // Empty-handler edge case: no request object is constructed.
            UserRequest::empty()
        };

        match &entry.method {
            UserMethod::Async(f) => {
                let f = Arc::clone(f);
                Box::pin(async move { send_unary_http_result(f(request).await, &send) })
            }
            UserMethod::Blocking(f) => {
                let f = Arc::clone(f);
                let offload = self.executor.run_sync_in_threadpool();
                if !offload {
                    self.warn_inline_sync(&info.name);
                }
                let executor = Arc::clone(&self.executor);
                Box::pin(async move {
                    let result = if offload {
                        let request_context = context::current_request_context();
                        match executor
                            .run_blocking(request_context, move || f(request))
                            .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(UserError::failed("worker thread was cancelled")),
                        }
                    } else {
                        f(request)
                    };
                    send_unary_http_result(result, &send)
                })
            }
            UserMethod::AsyncStream(f) => {
                let f = Arc::clone(f);
                Box::pin(async move {
                    send(HttpMessage::ResponseStart {
                        status: 200,
                        headers: Vec::new(),
                    });
                    let mut stream = f(request);
                    while let Some(item) = stream.next().await {
                        let value = item?;
                        send(HttpMessage::ResponseBody {
                            body: body_bytes(&value),
                            more_body: true,
                        });
                    }
                    send(HttpMessage::ResponseBody {
                        body: Bytes::new(),
                        more_body: false,
                    });
                    Ok(())
                })
            }
            UserMethod::BlockingStream(f) => {
                let f = Arc::clone(f);
                let offload = self.executor.run_sync_in_threadpool();
                if !offload {
                    self.warn_inline_sync(&info.name);
                }
                let executor = Arc::clone(&self.executor);
                Box::pin(async move {
                    send(HttpMessage::ResponseStart {
                        status: 200,
                        headers: Vec::new(),
                    });
                    let emitter = {
                        let send = Arc::clone(&send);
                        Emitter::new(move |value| {
                            send(HttpMessage::ResponseBody {
                                body: body_bytes(&value),
                                more_body: true,
                            })
                        })
                    };
                    let result = if offload {
                        let request_context = context::current_request_context();
                        match executor
                            .run_blocking(request_context, move || f(request, emitter))
                            .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(UserError::failed("worker thread was cancelled")),
                        }
                    } else {
                        f(request, emitter)
                    };
                    result?;
                    send(HttpMessage::ResponseBody {
                        body: Bytes::new(),
                        more_body: false,
                    });
                    Ok(())
                })
            }
        }
    }

    /// Invokes the user destructor at most once. Failures are logged, never
    /// raised.
    pub async fn call_destructor(&self) {
        let Some(deployment) = self.callable.get().cloned() else {
            tracing::info!("replica never started running user code; skipping destructor");
            return;
        };
        if self.destructor_called.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(hook) = deployment.destructor_hook() else {
            return;
        };
        match flatten(self.executor.spawn_user(None, async move { hook().await })).await {
            Ok(()) => {}
            Err(error) => {
                tracing::error!(%error, "exception during graceful shutdown of replica");
            }
        }
    }

    /// Stops the dedicated user loop, if one was started.
    pub fn shutdown(&self) {
        self.executor.shutdown();
    }
}

async fn flatten<T>(task: UserTask<Result<T, UserError>>) -> Result<T, ReplicaError> {
    task.await?.map_err(ReplicaError::from)
}

/// Sends the unary handler outcome over ASGI. Failures are translated to an
/// HTTP error response, then re-raised so the transport records a task
/// error.
fn send_unary_http_result(
    result: Result<UserValue, UserError>,
    send: &AsgiSend,
) -> Result<(), UserError> {
    match result {
        Ok(value) => {
            for message in default_http_response(value).messages() {
                send(message);
            }
            Ok(())
        }
        Err(error) => {
            for message in error_response(&error).messages() {
                send(message);
            }
            Err(error)
        }
    }
}

/// Wraps a non-response handler return value in a default JSON-capable
/// response.
fn default_http_response(value: UserValue) -> HttpResponse {
    match value {
        UserValue::Http(response) => response,
        UserValue::Json(value) => HttpResponse::json(&value),
        UserValue::Bytes(body) => HttpResponse::new(200)
            .with_header("content-type", "application/octet-stream")
            .with_body(body),
    }
}

fn error_response(error: &UserError) -> HttpResponse {
    match error {
        UserError::ServiceUnavailable { message } => HttpResponse::text(503, message.clone()),
        UserError::Failed { .. } => HttpResponse::text(500, "Internal Server Error"),
    }
}

fn body_bytes(value: &UserValue) -> Bytes {
    match value {
        UserValue::Json(value) => Bytes::from(serde_json::to_vec(value).unwrap_or_default()),
        UserValue::Bytes(body) => body.clone(),
        UserValue::Http(response) => response.body.clone(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
