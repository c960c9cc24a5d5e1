//! User-code hosting for the replica execution core.
//!
//! A [`Deployment`] is the user-provided handler: a table of named methods
//! classified at registration as async or blocking, unary or streaming, plus
//! optional lifecycle hooks (reconfigure, health check, routing stats,
//! destructor) and an optional ASGI application. The
//! [`UserCallableWrapper`] owns the deployment's lifecycle and dispatches
//! every call into it, isolating blocking user code from the plane loop via
//! the [`UserCodeExecutor`]. Streaming results cross loops through a
//! [`MessageQueue`].
//!
//! # Example
//!
//! ```rust
//! use serve_replica_callable::{Deployment, UserValue};
//!
//! let deployment = Deployment::builder()
//!     .method("call", |_request| async { Ok(UserValue::json("Success!")) })
//!     .health_check(|| async { Ok(()) })
//!     .build();
//! assert!(deployment.method_info("call").is_ok());
//! ```

pub mod deployment;
pub mod executor;
pub mod http;
pub mod queue;
pub mod wrapper;

pub use deployment::{
    Deployment, DeploymentBuilder, DeploymentFactory, Emitter, MethodKind, UserMethodInfo,
    UserRequest, UserValue,
};
pub use executor::{ExecutionMode, UserCodeExecutor, UserTask};
pub use http::{
    match_route, AsgiReceive, AsgiSend, HttpMessage, HttpRequest, HttpResponse, HttpScope,
};
pub use queue::MessageQueue;
pub use wrapper::{AsgiAppInfo, UserCallableWrapper};
