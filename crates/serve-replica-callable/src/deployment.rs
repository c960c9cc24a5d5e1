//! The user deployment: a table of named methods plus optional lifecycle
//! hooks.
//!
//! Each method is classified at registration as async or blocking, unary or
//! streaming, and that classification drives dispatch without inspecting
//! user code at call time.

use crate::http::{AsgiReceive, AsgiSend, HttpRequest, HttpScope};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{Future, Stream, StreamExt};
use serde_json::Value;
use serve_replica_core::{GrpcContext, ReplicaError, UserError};
use std::collections::HashMap;
use std::sync::Arc;

/// Data handed to a user method.
#[derive(Debug)]
pub enum UserRequest {
    /// Positional arguments from a handle call.
    Args(Vec<Value>),
    /// An HTTP request, for non-ASGI HTTP handlers.
    Http(HttpRequest),
    /// A gRPC message, paired with the call context when the method asks for
    /// it.
    Grpc {
        message: Bytes,
        context: Option<GrpcContext>,
    },
}

impl UserRequest {
    /// A call with no arguments.
    pub fn empty() -> Self {
        Self::Args(Vec::new())
    }

    pub fn args(args: impl IntoIterator<Item = Value>) -> Self {
        Self::Args(args.into_iter().collect())
    }
}

/// A value produced by a user method.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum UserValue {
    Json(Value),
    Bytes(Bytes),
    Http(crate::http::HttpResponse),
}

impl UserValue {
    pub fn json(value: impl Into<Value>) -> Self {
        Self::Json(value.into())
    }

    pub fn bytes(value: impl Into<Bytes>) -> Self {
        Self::Bytes(value.into())
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// Callback through which blocking streaming methods yield items.
#[derive(Clone)]
pub struct Emitter {
    send: Arc<dyn Fn(UserValue) + Send + Sync>,
}

impl Emitter {
    pub fn new(send: impl Fn(UserValue) + Send + Sync + 'static) -> Self {
        Self {
            send: Arc::new(send),
        }
    }

    pub fn emit(&self, value: UserValue) {
        (self.send)(value)
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter").finish_non_exhaustive()
    }
}

pub type UnaryFn =
    Arc<dyn Fn(UserRequest) -> BoxFuture<'static, Result<UserValue, UserError>> + Send + Sync>;
pub type StreamFn =
    Arc<dyn Fn(UserRequest) -> BoxStream<'static, Result<UserValue, UserError>> + Send + Sync>;
pub type BlockingFn = Arc<dyn Fn(UserRequest) -> Result<UserValue, UserError> + Send + Sync>;
pub type BlockingStreamFn =
    Arc<dyn Fn(UserRequest, Emitter) -> Result<(), UserError> + Send + Sync>;
pub type AsgiFn = Arc<
    dyn Fn(HttpScope, AsgiReceive, AsgiSend) -> BoxFuture<'static, Result<(), UserError>>
        + Send
        + Sync,
>;
pub type ReconfigureFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<(), UserError>> + Send + Sync>;
pub type HealthCheckFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), UserError>> + Send + Sync>;
pub type RoutingStatsFn = Arc<
    dyn Fn() -> BoxFuture<'static, Result<serde_json::Map<String, Value>, UserError>>
        + Send
        + Sync,
>;
pub type DestructorFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), UserError>> + Send + Sync>;

/// Async constructor for a [`Deployment`]. Invoked exactly once per replica
/// lifetime, on the user loop.
pub type DeploymentFactory =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<Deployment, UserError>> + Send>;

/// Execution classification of a user method, fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// Asynchronous unary method.
    Async,
    /// Asynchronous streaming method.
    AsyncStream,
    /// Blocking unary method, offloadable to a worker thread.
    Blocking,
    /// Blocking streaming method yielding through an [`Emitter`].
    BlockingStream,
    /// The deployment's ASGI application.
    Asgi,
}

impl MethodKind {
    pub fn is_streaming(self) -> bool {
        matches!(self, MethodKind::AsyncStream | MethodKind::BlockingStream)
    }

    pub fn is_blocking(self) -> bool {
        matches!(self, MethodKind::Blocking | MethodKind::BlockingStream)
    }
}

/// Cached metadata about one user method.
#[derive(Debug, Clone)]
pub struct UserMethodInfo {
    pub name: String,
    pub kind: MethodKind,
    pub is_asgi_app: bool,
    pub takes_request: bool,
    pub takes_grpc_context: bool,
}

pub(crate) enum UserMethod {
    Async(UnaryFn),
    AsyncStream(StreamFn),
    Blocking(BlockingFn),
    BlockingStream(BlockingStreamFn),
}

impl UserMethod {
    fn kind(&self) -> MethodKind {
        match self {
            UserMethod::Async(_) => MethodKind::Async,
            UserMethod::AsyncStream(_) => MethodKind::AsyncStream,
            UserMethod::Blocking(_) => MethodKind::Blocking,
            UserMethod::BlockingStream(_) => MethodKind::BlockingStream,
        }
    }
}

pub(crate) struct MethodEntry {
    pub(crate) method: UserMethod,
    pub(crate) takes_request: bool,
    pub(crate) takes_grpc_context: bool,
}

pub(crate) struct AsgiApp {
    pub(crate) handler: AsgiFn,
    pub(crate) routes: Vec<String>,
    pub(crate) docs_path: Option<String>,
}

/// A user deployment: named request methods plus optional lifecycle hooks.
pub struct Deployment {
    methods: HashMap<String, MethodEntry>,
    asgi: Option<AsgiApp>,
    reconfigure: Option<ReconfigureFn>,
    health_check: Option<HealthCheckFn>,
    record_routing_stats: Option<RoutingStatsFn>,
    destructor: Option<DestructorFn>,
}

impl Deployment {
    pub fn builder() -> DeploymentBuilder {
        DeploymentBuilder::new()
    }

    pub fn is_asgi_app(&self) -> bool {
        self.asgi.is_some()
    }

    /// Registered method names, sorted for stable error messages.
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    /// Classification of the named method.
    ///
    /// For ASGI-app deployments an unregistered name resolves to the app
    /// itself, matching how such deployments handle every HTTP route.
    pub fn method_info(&self, method: &str) -> Result<UserMethodInfo, ReplicaError> {
        if let Some(entry) = self.methods.get(method) {
            return Ok(UserMethodInfo {
                name: method.to_string(),
                kind: entry.method.kind(),
                is_asgi_app: self.is_asgi_app(),
                takes_request: entry.takes_request,
                takes_grpc_context: entry.takes_grpc_context,
            });
        }
        if self.is_asgi_app() {
            return Ok(UserMethodInfo {
                name: method.to_string(),
                kind: MethodKind::Asgi,
                is_asgi_app: true,
                takes_request: true,
                takes_grpc_context: false,
            });
        }
        Err(ReplicaError::MethodNotFound {
            method: method.to_string(),
            available: self.method_names(),
        })
    }

    pub(crate) fn entry(&self, method: &str) -> Option<&MethodEntry> {
        self.methods.get(method)
    }

    pub(crate) fn asgi(&self) -> Option<&AsgiApp> {
        self.asgi.as_ref()
    }

    pub(crate) fn reconfigure_hook(&self) -> Option<ReconfigureFn> {
        self.reconfigure.clone()
    }

    pub(crate) fn health_check_hook(&self) -> Option<HealthCheckFn> {
        self.health_check.clone()
    }

    pub(crate) fn record_routing_stats_hook(&self) -> Option<RoutingStatsFn> {
        self.record_routing_stats.clone()
    }

    pub(crate) fn destructor_hook(&self) -> Option<DestructorFn> {
        self.destructor.clone()
    }
}

/// Builder for [`Deployment`].
pub struct DeploymentBuilder {
    methods: HashMap<String, MethodEntry>,
    asgi_handler: Option<AsgiFn>,
    asgi_routes: Vec<String>,
    docs_path: Option<String>,
    reconfigure: Option<ReconfigureFn>,
    health_check: Option<HealthCheckFn>,
    record_routing_stats: Option<RoutingStatsFn>,
    destructor: Option<DestructorFn>,
}

impl DeploymentBuilder {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
            asgi_handler: None,
            asgi_routes: Vec::new(),
            docs_path: None,
            reconfigure: None,
            health_check: None,
            record_routing_stats: None,
            destructor: None,
        }
    }

    fn insert(mut self, name: impl Into<String>, method: UserMethod, takes_request: bool) -> Self {
        self.methods.insert(
            name.into(),
            MethodEntry {
                method,
                takes_request,
                takes_grpc_context: false,
            },
        );
        self
    }

    /// Registers an asynchronous unary method.
    pub fn method<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(UserRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<UserValue, UserError>> + Send + 'static,
    {
        self.insert(
            name,
            UserMethod::Async(Arc::new(move |request| Box::pin(f(request)))),
            true,
        )
    }

    /// Registers an asynchronous unary method that takes no request data.
    ///
    /// Over HTTP such handlers are invoked without a request object being
    /// constructed at all.
    pub fn method_without_request<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<UserValue, UserError>> + Send + 'static,
    {
        self.insert(
            name,
            UserMethod::Async(Arc::new(move |_request| Box::pin(f()))),
            false,
        )
    }

    /// Registers an asynchronous streaming method.
    pub fn stream_method<F, S>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(UserRequest) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<UserValue, UserError>> + Send + 'static,
    {
        self.insert(
            name,
            UserMethod::AsyncStream(Arc::new(move |request| f(request).boxed())),
            true,
        )
    }

    /// Registers a blocking unary method.
    ///
    /// Runs on a worker thread when threadpool offload is enabled, otherwise
    /// inline on the user loop.
    pub fn blocking_method<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(UserRequest) -> Result<UserValue, UserError> + Send + Sync + 'static,
    {
        self.insert(name, UserMethod::Blocking(Arc::new(f)), true)
    }

    /// Registers a blocking streaming method yielding through the [`Emitter`].
    pub fn blocking_stream_method<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(UserRequest, Emitter) -> Result<(), UserError> + Send + Sync + 'static,
    {
        self.insert(name, UserMethod::BlockingStream(Arc::new(f)), true)
    }

    /// Marks a registered method as taking the gRPC call context.
    pub fn takes_grpc_context(mut self, name: &str) -> Self {
        if let Some(entry) = self.methods.get_mut(name) {
            entry.takes_grpc_context = true;
        }
        self
    }

    /// Registers the deployment's ASGI application.
    pub fn asgi_app<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(HttpScope, AsgiReceive, AsgiSend) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), UserError>> + Send + 'static,
    {
        self.asgi_handler = Some(Arc::new(move |scope, receive, send| {
            Box::pin(f(scope, receive, send))
        }));
        self
    }

    /// Adds a router pattern used to refine the matched route in logs and
    /// metric tags.
    pub fn asgi_route(mut self, pattern: impl Into<String>) -> Self {
        self.asgi_routes.push(pattern.into());
        self
    }

    pub fn docs_path(mut self, path: impl Into<String>) -> Self {
        self.docs_path = Some(path.into());
        self
    }

    /// Registers the reconfigure hook invoked when `user_config` changes.
    pub fn reconfigure<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), UserError>> + Send + 'static,
    {
        self.reconfigure = Some(Arc::new(move |config| Box::pin(f(config))));
        self
    }

    /// Registers the health check hook.
    pub fn health_check<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), UserError>> + Send + 'static,
    {
        self.health_check = Some(Arc::new(move || Box::pin(f())));
        self
    }

    /// Registers the routing stats hook.
    pub fn record_routing_stats<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Map<String, Value>, UserError>> + Send + 'static,
    {
        self.record_routing_stats = Some(Arc::new(move || Box::pin(f())));
        self
    }

    /// Registers the destructor, invoked at most once during shutdown.
    pub fn destructor<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), UserError>> + Send + 'static,
    {
        self.destructor = Some(Arc::new(move || Box::pin(f())));
        self
    }

    pub fn build(self) -> Deployment {
        Deployment {
            methods: self.methods,
            asgi: self.asgi_handler.map(|handler| AsgiApp {
                handler,
                routes: self.asgi_routes,
                docs_path: self.docs_path,
            }),
            reconfigure: self.reconfigure,
            health_check: self.health_check,
            record_routing_stats: self.record_routing_stats,
            destructor: self.destructor,
        }
    }
}

impl Default for DeploymentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_deployment() -> Deployment {
        Deployment::builder()
            .method("call", |_request| async { Ok(UserValue::json("ok")) })
            .blocking_method("compute", |_request| Ok(UserValue::json(42)))
            .stream_method("stream", |_request| {
                futures::stream::iter(vec![Ok(UserValue::json("a"))])
            })
            .build()
    }

    #[test]
    fn method_info_classifies_kinds() {
        let deployment = test_deployment();
        assert_eq!(
            deployment.method_info("call").unwrap().kind,
            MethodKind::Async
        );
        assert_eq!(
            deployment.method_info("compute").unwrap().kind,
            MethodKind::Blocking
        );
        assert_eq!(
            deployment.method_info("stream").unwrap().kind,
            MethodKind::AsyncStream
        );
    }

    #[test]
    fn missing_method_lists_available() {
        let deployment = test_deployment();
        let err = deployment.method_info("nope").unwrap_err();
        match err {
            ReplicaError::MethodNotFound { method, available } => {
                assert_eq!(method, "nope");
                assert_eq!(available, vec!["call", "compute", "stream"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn asgi_app_resolves_any_method_name() {
        let deployment = Deployment::builder()
            .asgi_app(|_scope, _receive, _send| async { Ok(()) })
            .build();
        let info = deployment.method_info("anything").unwrap();
        assert_eq!(info.kind, MethodKind::Asgi);
        assert!(info.is_asgi_app);
    }

    #[test]
    fn grpc_context_flag() {
        let deployment = Deployment::builder()
            .blocking_method("predict", |_request| Ok(UserValue::json(1)))
            .takes_grpc_context("predict")
            .build();
        assert!(deployment.method_info("predict").unwrap().takes_grpc_context);
    }
}
