//! Shared data model for the serve-replica execution core.
//!
//! This crate defines the types every other crate in the workspace speaks:
//! deployment and replica identities, the runtime-mutable deployment config
//! and its content-addressed version, per-request metadata, the error
//! taxonomy, environment toggles, and the task-scoped contexts installed
//! around user code.

pub mod config;
pub mod context;
pub mod env;
pub mod error;
pub mod id;
pub mod metadata;

pub use config::{
    AutoscalingConfig, DeploymentConfig, DeploymentConfigBuilder, DeploymentVersion, LogEncoding,
    LoggingConfig,
};
pub use context::{ReplicaContext, RequestContext, StatusCodeCallback};
pub use env::RuntimeEnv;
pub use error::{ReplicaError, UserError};
pub use id::{DeploymentID, ReplicaID};
pub use metadata::{GrpcContext, LegacyRequestMetadata, ReplicaQueueLengthInfo, RequestMetadata};
