//! The replica core: admission, dispatch, error/metrics wrapping, lifecycle.

use crate::logging;
use crate::registry::RequestRegistry;
use async_stream::stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serve_replica_admission::{AdmissionPermit, AdmissionSemaphore};
use serve_replica_callable::{
    match_route, AsgiAppInfo, DeploymentFactory, ExecutionMode, HttpMessage, UserCallableWrapper,
    UserRequest, UserValue,
};
use serve_replica_core::context::ReplicaContext;
use serve_replica_core::{
    DeploymentConfig, DeploymentVersion, ReplicaError, ReplicaID, ReplicaQueueLengthInfo,
    RequestMetadata, RuntimeEnv, StatusCodeCallback, UserError,
};
use serve_replica_metrics::{ControllerClient, ReplicaMetricsManager};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Health of the replica as reported by health checks.
///
/// Starts `Unknown`; the first successful check makes the replica `Healthy`
/// (its "serving" transition), after which checks toggle between `Healthy`
/// and `Unhealthy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => HealthState::Healthy,
            2 => HealthState::Unhealthy,
            _ => HealthState::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            HealthState::Unknown => 0,
            HealthState::Healthy => 1,
            HealthState::Unhealthy => 2,
        }
    }
}

/// One chunk of a streaming response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseChunk {
    /// The rejection-protocol system message. Always first; alone when
    /// `accepted` is false.
    QueueLength(ReplicaQueueLengthInfo),
    /// A micro-batch of HTTP response messages.
    Http(Vec<HttpMessage>),
    /// One item yielded by a streaming user method, or the single result of
    /// a unary call under the rejection protocol.
    Item(UserValue),
}

/// Metadata returned by `initialize_and_get_metadata` and `reconfigure`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaMetadata {
    pub deployment_config: DeploymentConfig,
    pub version: DeploymentVersion,
    pub initialization_latency_s: Option<f64>,
    pub port: Option<u16>,
    pub docs_path: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Ok,
    Cancelled,
    Error,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Outcome::Ok => "OK",
            Outcome::Cancelled => "CANCELLED",
            Outcome::Error => "ERROR",
        }
    }
}

struct ReplicaInner {
    replica_id: ReplicaID,
    ingress: bool,
    route_prefix: String,
    env: RuntimeEnv,
    config: RwLock<DeploymentConfig>,
    version: RwLock<DeploymentVersion>,
    max_ongoing_requests: Arc<AtomicUsize>,
    semaphore: AdmissionSemaphore,
    user_callable: Arc<UserCallableWrapper>,
    metrics: Arc<ReplicaMetricsManager>,
    // Guards against constructing the user callable more than once.
    init_lock: tokio::sync::Mutex<bool>,
    initialization_latency: Mutex<Option<Duration>>,
    health: AtomicU8,
    shutting_down: AtomicBool,
    registry: Arc<RequestRegistry>,
    asgi_info: RwLock<Option<AsgiAppInfo>>,
    port: RwLock<Option<u16>>,
}

/// A single running worker hosting one instance of a user deployment.
///
/// Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Replica {
    inner: Arc<ReplicaInner>,
}

impl Replica {
    /// Creates the replica, starting its metrics subsystem and (in the
    /// separate-loop placement) the user code loop. The user callable is not
    /// constructed until [`initialize`](Replica::initialize).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        replica_id: ReplicaID,
        factory: DeploymentFactory,
        deployment_config: DeploymentConfig,
        code_version: impl Into<String>,
        ingress: bool,
        route_prefix: impl Into<String>,
        controller: Arc<dyn ControllerClient>,
        env: RuntimeEnv,
    ) -> Result<Self, ReplicaError> {
        logging::configure_component_logger(
            &replica_id.deployment_id.component_name(),
            &replica_id.unique_id,
            &deployment_config.logging_config,
            env.request_path_log_buffer_size,
        );

        let mode = if env.run_user_code_in_separate_loop {
            ExecutionMode::SeparateUserLoop
        } else {
            ExecutionMode::SharedLoop
        };
        let user_callable = Arc::new(UserCallableWrapper::new(
            replica_id.deployment_id.clone(),
            factory,
            mode,
            env.run_sync_in_threadpool,
            deployment_config.max_ongoing_requests,
        )?);

        let max_ongoing_requests = Arc::new(AtomicUsize::new(
            deployment_config.max_ongoing_requests,
        ));
        let accessor = Arc::clone(&max_ongoing_requests);
        let semaphore =
            AdmissionSemaphore::new(Arc::new(move || accessor.load(Ordering::SeqCst)));

        let metrics = ReplicaMetricsManager::new(
            replica_id.clone(),
            deployment_config.autoscaling_config.clone(),
            controller,
            &env,
        );

        let version = DeploymentVersion::new(code_version, &deployment_config);
        let replica = Self {
            inner: Arc::new(ReplicaInner {
                replica_id,
                ingress,
                route_prefix: route_prefix.into(),
                env,
                config: RwLock::new(deployment_config),
                version: RwLock::new(version),
                max_ongoing_requests,
                semaphore,
                user_callable,
                metrics,
                init_lock: tokio::sync::Mutex::new(false),
                initialization_latency: Mutex::new(None),
                health: AtomicU8::new(HealthState::Unknown.as_u8()),
                shutting_down: AtomicBool::new(false),
                registry: Arc::new(RequestRegistry::new()),
                asgi_info: RwLock::new(None),
                port: RwLock::new(None),
            }),
        };
        replica.refresh_replica_context();
        Ok(replica)
    }

    pub fn replica_id(&self) -> &ReplicaID {
        &self.inner.replica_id
    }

    pub fn is_ingress(&self) -> bool {
        self.inner.ingress
    }

    pub fn route_prefix(&self) -> &str {
        &self.inner.route_prefix
    }

    pub fn max_ongoing_requests(&self) -> usize {
        self.inner.max_ongoing_requests.load(Ordering::SeqCst)
    }

    /// Current number of ongoing requests. Never blocks on user code.
    pub fn get_num_ongoing_requests(&self) -> usize {
        self.inner.metrics.get_num_ongoing_requests()
    }

    pub fn health_state(&self) -> HealthState {
        HealthState::from_u8(self.inner.health.load(Ordering::SeqCst))
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Registry of child requests, exposed so handle-side code can track
    /// pending and in-flight children for recursive cancellation.
    pub fn request_registry(&self) -> &Arc<RequestRegistry> {
        &self.inner.registry
    }

    pub fn set_port(&self, port: u16) {
        *write(&self.inner.port) = Some(port);
    }

    pub fn metadata(&self) -> ReplicaMetadata {
        ReplicaMetadata {
            deployment_config: read(&self.inner.config).clone(),
            version: read(&self.inner.version).clone(),
            initialization_latency_s: lock(&self.inner.initialization_latency)
                .map(|d| d.as_secs_f64()),
            port: *read(&self.inner.port),
            docs_path: read(&self.inner.asgi_info)
                .as_ref()
                .and_then(|info| info.docs_path.clone()),
        }
    }

    fn set_health(&self, state: HealthState) {
        self.inner.health.store(state.as_u8(), Ordering::SeqCst);
    }

    fn refresh_replica_context(&self) {
        self.inner
            .user_callable
            .set_replica_context(Arc::new(ReplicaContext {
                replica_id: self.inner.replica_id.clone(),
                deployment_config: read(&self.inner.config).clone(),
            }));
    }

    /// A new request can be accepted iff the admission semaphore is not
    /// currently locked.
    fn can_accept_request(&self) -> bool {
        !self.inner.semaphore.locked()
    }

    async fn start_request(&self) -> OngoingGuard {
        let permit = self.inner.semaphore.acquire().await;
        self.inner.metrics.inc_num_ongoing_requests();
        OngoingGuard {
            metrics: Arc::clone(&self.inner.metrics),
            _permit: permit,
        }
    }

    /// Refines metadata from the request payload: captures the HTTP method,
    /// matches the route against the ASGI router, and attaches the gRPC
    /// context to methods that ask for it.
    fn unpack_request(
        &self,
        mut metadata: RequestMetadata,
        request: UserRequest,
    ) -> Result<(RequestMetadata, UserRequest), ReplicaError> {
        if metadata.is_http_request {
            if let UserRequest::Http(http) = &request {
                metadata.http_method = Some(http.scope.method.clone());
                let matched = read(&self.inner.asgi_info)
                    .as_ref()
                    .and_then(|info| match_route(&info.routes, &http.scope.path));
                // No match in the app's router keeps the route from the
                // incoming metadata.
                if let Some(route) = matched {
                    metadata.route = route;
                }
            }
        } else if metadata.is_grpc_request {
            if let UserRequest::Grpc { message, .. } = request {
                let info = self
                    .inner
                    .user_callable
                    .user_method_info(&metadata.call_method)?;
                let context = if info.takes_grpc_context {
                    metadata.grpc_context.clone()
                } else {
                    None
                };
                return Ok((metadata, UserRequest::Grpc { message, context }));
            }
        }
        Ok((metadata, request))
    }

    /// Handles a unary request: install context, wrap errors/metrics,
    /// acquire admission, dispatch.
    pub async fn handle_request(
        &self,
        metadata: RequestMetadata,
        request: UserRequest,
    ) -> Result<UserValue, ReplicaError> {
        let (metadata, request) = self.unpack_request(metadata, request)?;
        let wrap = RequestWrap::begin(self, &metadata);
        let result = async {
            let _guard = self.start_request().await;
            self.inner
                .user_callable
                .call_user_method(&metadata, request)
                .await
        }
        .await;
        wrap.finish(result)
    }

    /// Handles a streaming request, yielding chunks in user order.
    pub fn handle_request_streaming(
        &self,
        metadata: RequestMetadata,
        request: UserRequest,
    ) -> BoxStream<'static, Result<ResponseChunk, ReplicaError>> {
        let this = self.clone();
        Box::pin(stream! {
            let (metadata, request) = match this.unpack_request(metadata, request) {
                Ok(unpacked) => unpacked,
                Err(error) => {
                    yield Err(error);
                    return;
                }
            };
            let wrap = RequestWrap::begin(&this, &metadata);
            let guard = this.start_request().await;
            let mut results = this.user_result_stream(metadata, request, wrap, guard);
            while let Some(chunk) = results.next().await {
                yield chunk;
            }
        })
    }

    /// The admission protocol: the first chunk advertises acceptance and the
    /// current queue length. A rejected request never touches user code.
    pub fn handle_request_with_rejection(
        &self,
        metadata: RequestMetadata,
        request: UserRequest,
    ) -> BoxStream<'static, Result<ResponseChunk, ReplicaError>> {
        let this = self.clone();
        Box::pin(stream! {
            if !this.can_accept_request() {
                let limit = this.max_ongoing_requests();
                tracing::warn!(
                    request_id = %metadata.request_id,
                    max_ongoing_requests = limit,
                    "replica at capacity, rejecting request"
                );
                yield Ok(ResponseChunk::QueueLength(ReplicaQueueLengthInfo {
                    accepted: false,
                    num_ongoing_requests: this.get_num_ongoing_requests(),
                }));
                return;
            }

            let (metadata, request) = match this.unpack_request(metadata, request) {
                Ok(unpacked) => unpacked,
                Err(error) => {
                    yield Err(error);
                    return;
                }
            };
            let wrap = RequestWrap::begin(&this, &metadata);
            let guard = this.start_request().await;
            // The ongoing count now includes this request; re-fetch it for
            // the system message.
            yield Ok(ResponseChunk::QueueLength(ReplicaQueueLengthInfo {
                accepted: true,
                num_ongoing_requests: this.get_num_ongoing_requests(),
            }));

            let mut results = this.user_result_stream(metadata, request, wrap, guard);
            while let Some(chunk) = results.next().await {
                yield chunk;
            }
        })
    }

    /// Drives the user call for an admitted request, yielding HTTP batches,
    /// stream items, or the single unary result.
    fn user_result_stream(
        &self,
        metadata: RequestMetadata,
        request: UserRequest,
        wrap: RequestWrap,
        guard: OngoingGuard,
    ) -> BoxStream<'static, Result<ResponseChunk, ReplicaError>> {
        let this = self.clone();
        Box::pin(stream! {
            let _guard = guard;
            if metadata.is_http_request {
                let (scope, receive) = match request {
                    UserRequest::Http(http) => (http.scope, http.receive),
                    _ => {
                        let error = ReplicaError::User(UserError::failed(
                            "HTTP request did not carry an HTTP payload",
                        ));
                        yield Err(wrap.finish_err(error));
                        return;
                    }
                };
                let batches = this.inner.user_callable.call_http_entrypoint(
                    &metadata,
                    wrap.status_code_callback(),
                    scope,
                    receive,
                );
                let mut batches = match batches {
                    Ok(batches) => batches,
                    Err(error) => {
                        yield Err(wrap.finish_err(error));
                        return;
                    }
                };
                while let Some(batch) = batches.next().await {
                    match batch {
                        Ok(messages) => yield Ok(ResponseChunk::Http(messages)),
                        Err(error) => {
                            yield Err(wrap.finish_err(error));
                            return;
                        }
                    }
                }
                wrap.finish_ok();
            } else if metadata.is_streaming {
                let items = this
                    .inner
                    .user_callable
                    .call_user_generator(&metadata, request);
                let mut items = match items {
                    Ok(items) => items,
                    Err(error) => {
                        yield Err(wrap.finish_err(error));
                        return;
                    }
                };
                while let Some(item) = items.next().await {
                    match item {
                        Ok(value) => yield Ok(ResponseChunk::Item(value)),
                        Err(error) => {
                            yield Err(wrap.finish_err(error));
                            return;
                        }
                    }
                }
                wrap.finish_ok();
            } else {
                match this
                    .inner
                    .user_callable
                    .call_user_method(&metadata, request)
                    .await
                {
                    Ok(value) => {
                        yield Ok(ResponseChunk::Item(value));
                        wrap.finish_ok();
                    }
                    Err(error) => {
                        yield Err(wrap.finish_err(error));
                    }
                }
            }
        })
    }

    /// Initializes the replica: constructs the user callable exactly once,
    /// applies the config, and runs an initial health check. Idempotent
    /// under a mutual-exclusion guard; any failure is wrapped as an
    /// initialization error.
    pub async fn initialize(
        &self,
        deployment_config: Option<DeploymentConfig>,
    ) -> Result<(), ReplicaError> {
        let result: Result<(), ReplicaError> = async {
            {
                let mut initialized = self.inner.init_lock.lock().await;
                let start = Instant::now();
                if !*initialized {
                    let asgi_info = self.inner.user_callable.initialize_callable().await?;
                    *write(&self.inner.asgi_info) = asgi_info;
                    self.on_initialized(start);
                    *initialized = true;
                }
                if let Some(config) = deployment_config {
                    self.inner
                        .user_callable
                        .set_sync_method_threadpool_limit(config.max_ongoing_requests);
                    self.inner
                        .max_ongoing_requests
                        .store(config.max_ongoing_requests, Ordering::SeqCst);
                    self.inner.semaphore.notify_capacity_changed();
                    let user_config = config.user_config.clone();
                    *write(&self.inner.config) = config;
                    self.inner.user_callable.call_reconfigure(user_config).await?;
                    self.refresh_replica_context();
                }
            }
            // A new replica is not considered healthy until it passes an
            // initial health check; a failed one is an initialization
            // failure.
            self.check_health().await?;
            Ok(())
        }
        .await;
        result.map_err(|error| match error {
            wrapped @ ReplicaError::Initialization { .. } => wrapped,
            other => ReplicaError::Initialization {
                message: other.to_string(),
            },
        })
    }

    fn on_initialized(&self, start: Instant) {
        self.refresh_replica_context();
        let mut latency = lock(&self.inner.initialization_latency);
        if latency.is_none() {
            *latency = Some(start.elapsed());
        }
    }

    /// Applies a new deployment config in place.
    pub async fn reconfigure(
        &self,
        deployment_config: DeploymentConfig,
    ) -> Result<(), ReplicaError> {
        let (user_config_changed, logging_config_changed) = {
            let current = read(&self.inner.config);
            (
                deployment_config.user_config != current.user_config,
                deployment_config.logging_config != current.logging_config,
            )
        };

        {
            let mut version = write(&self.inner.version);
            *version = DeploymentVersion::from_previous(&version, &deployment_config);
        }
        self.inner
            .max_ongoing_requests
            .store(deployment_config.max_ongoing_requests, Ordering::SeqCst);
        self.inner.semaphore.notify_capacity_changed();
        self.inner
            .metrics
            .set_autoscaling_config(deployment_config.autoscaling_config.clone());
        if logging_config_changed {
            logging::configure_component_logger(
                &self.inner.replica_id.deployment_id.component_name(),
                &self.inner.replica_id.unique_id,
                &deployment_config.logging_config,
                self.inner.env.request_path_log_buffer_size,
            );
        }
        self.inner
            .user_callable
            .set_sync_method_threadpool_limit(deployment_config.max_ongoing_requests);

        let user_config = deployment_config.user_config.clone();
        *write(&self.inner.config) = deployment_config;
        if user_config_changed {
            self.inner.user_callable.call_reconfigure(user_config).await?;
        }
        self.refresh_replica_context();
        Ok(())
    }

    /// Runs the user health check, if one is registered, and updates the
    /// health flag. Failures are surfaced to the caller.
    pub async fn check_health(&self) -> Result<(), ReplicaError> {
        let outcome = async {
            // With no user-defined health check, nothing runs on the user
            // loop and the check passes trivially.
            match self.inner.user_callable.call_user_health_check()? {
                None => Ok(()),
                Some(task) => task.await?.map_err(ReplicaError::from),
            }
        }
        .await;
        match outcome {
            Ok(()) => {
                self.set_health(HealthState::Healthy);
                Ok(())
            }
            Err(error) => {
                tracing::warn!(%error, "replica health check failed");
                self.set_health(HealthState::Unhealthy);
                Err(ReplicaError::HealthCheckFailed {
                    message: error.to_string(),
                })
            }
        }
    }

    /// Runs the user routing-stats hook and returns its dict. Surfaces
    /// failures to the caller; an absent hook yields an empty dict.
    pub async fn record_routing_stats(
        &self,
    ) -> Result<serde_json::Map<String, serde_json::Value>, ReplicaError> {
        match self.inner.user_callable.call_user_record_routing_stats()? {
            None => Ok(serde_json::Map::new()),
            Some(task) => match task.await?.map_err(ReplicaError::from) {
                Ok(stats) => Ok(stats),
                Err(error) => {
                    tracing::warn!(%error, "replica record routing stats failed");
                    Err(error)
                }
            },
        }
    }

    /// Drains in-flight work, then destroys the user callable and shuts the
    /// metrics subsystem down.
    pub async fn perform_graceful_shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);

        // A replica that was never initialized never served traffic, so the
        // wait period can be skipped.
        if self.inner.user_callable.is_initialized() {
            self.drain_ongoing_requests().await;
        }
        self.shutdown().await;
    }

    async fn drain_ongoing_requests(&self) {
        let wait_loop_period = read(&self.inner.config).graceful_shutdown_wait_loop_s;
        loop {
            tokio::time::sleep(wait_loop_period).await;
            let num_ongoing_requests = self.get_num_ongoing_requests();
            if num_ongoing_requests > 0 {
                tracing::info!(
                    num_ongoing_requests,
                    wait_loop_period_s = wait_loop_period.as_secs_f64(),
                    "waiting for ongoing requests to finish before shutting down"
                );
            } else {
                tracing::info!("graceful shutdown complete; replica exiting");
                break;
            }
        }
    }

    async fn shutdown(&self) {
        self.inner.user_callable.call_destructor().await;
        self.inner.metrics.shutdown().await;
        self.inner.user_callable.shutdown();
    }

    fn on_request_cancelled(&self, metadata: &RequestMetadata) {
        // Recursively cancel child requests: both admission waiters and
        // already-assigned results registered under this request.
        self.inner
            .registry
            .cancel_children(&metadata.internal_request_id);
    }
}

/// Holds the admission permit and the ongoing-request count for one admitted
/// request. Both are released on drop, on every exit path.
struct OngoingGuard {
    metrics: Arc<ReplicaMetricsManager>,
    _permit: AdmissionPermit,
}

impl Drop for OngoingGuard {
    fn drop(&mut self) {
        self.metrics.dec_num_ongoing_requests();
    }
}

/// Error/metrics wrapper around one request.
///
/// Classifies the outcome as OK, CANCELLED, or ERROR, emits the access-log
/// line, and records per-request metrics. If the wrapper is dropped without
/// an explicit finish the request was cancelled, and child requests are
/// cancelled recursively.
struct RequestWrap {
    replica: Replica,
    metadata: RequestMetadata,
    start: Instant,
    status_code: Arc<Mutex<Option<u16>>>,
    finished: bool,
}

impl RequestWrap {
    fn begin(replica: &Replica, metadata: &RequestMetadata) -> Self {
        Self {
            replica: replica.clone(),
            metadata: metadata.clone(),
            start: Instant::now(),
            status_code: Arc::new(Mutex::new(None)),
            finished: false,
        }
    }

    fn status_code_callback(&self) -> StatusCodeCallback {
        let cell = Arc::clone(&self.status_code);
        Arc::new(move |status| {
            *lock(&cell) = Some(status);
        })
    }

    fn finish<T>(self, result: Result<T, ReplicaError>) -> Result<T, ReplicaError> {
        match result {
            Ok(value) => {
                self.finish_ok();
                Ok(value)
            }
            Err(error) => Err(self.finish_err(error)),
        }
    }

    fn finish_ok(mut self) {
        self.finished = true;
        self.record(Outcome::Ok);
    }

    fn finish_err(mut self, error: ReplicaError) -> ReplicaError {
        self.finished = true;
        match &error {
            ReplicaError::Cancelled => {
                self.replica.on_request_cancelled(&self.metadata);
                self.record(Outcome::Cancelled);
            }
            other => {
                tracing::error!(error = %other, "request failed");
                self.record(Outcome::Error);
            }
        }
        error
    }

    fn record(&self, outcome: Outcome) {
        let latency_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        let status_code = *lock(&self.status_code);
        // Prefer the HTTP status code if it was populated.
        let status = status_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| outcome.as_str().to_string());
        let method = self.metadata.http_method.as_deref().unwrap_or("CALL");
        let route = if self.metadata.route.is_empty() {
            self.metadata.call_method.as_str()
        } else {
            self.metadata.route.as_str()
        };

        if read(&self.replica.inner.config).logging_config.enable_access_log {
            tracing::info!(
                target: "serve_replica::access",
                method,
                route,
                status = %status,
                latency_ms,
                "request finished"
            );
            logging::record_access_log(logging::access_log_msg(
                method, route, &status, latency_ms,
            ));
        }

        self.replica.inner.metrics.record_request_metrics(
            &self.metadata.route,
            latency_ms,
            outcome != Outcome::Ok,
        );
        self.replica
            .inner
            .registry
            .clear(&self.metadata.internal_request_id);
    }
}

impl Drop for RequestWrap {
    fn drop(&mut self) {
        if !self.finished {
            self.finished = true;
            self.replica.on_request_cancelled(&self.metadata);
            self.record(Outcome::Cancelled);
        }
    }
}

fn read<T>(rwlock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match rwlock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(rwlock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match rwlock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
