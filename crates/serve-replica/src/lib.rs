//! Replica execution core for a serving framework.
//!
//! The per-worker runtime that hosts a user-provided request handler, admits
//! and meters concurrent requests against a configured ceiling, executes
//! unary and streaming calls with cancellation, surfaces health and routing
//! statistics, and shuts down gracefully while draining in-flight work.
//!
//! The [`Replica`] is the orchestrator; the [`ReplicaActor`] is its external
//! RPC surface. Requests flow proxy → actor → replica → admission →
//! dispatch into the user deployment, with results streamed back through a
//! thread-safe FIFO and metrics observing every call.
//!
//! # Example
//!
//! ```rust,no_run
//! use serve_replica::{NodeInfo, ReplicaActor};
//! use serve_replica_callable::{Deployment, DeploymentFactory, UserValue};
//! use serve_replica_core::{DeploymentConfig, DeploymentID, ReplicaID};
//! use serve_replica_metrics::NoopControllerClient;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), serve_replica_core::ReplicaError> {
//! let factory: DeploymentFactory = Box::new(|| {
//!     Box::pin(async {
//!         Ok(Deployment::builder()
//!             .method("call", |_request| async { Ok(UserValue::json("Success!")) })
//!             .build())
//!     })
//! });
//!
//! let actor = ReplicaActor::new(
//!     ReplicaID::new(DeploymentID::new("app", "model"), "replica-1"),
//!     factory,
//!     DeploymentConfig::builder().max_ongoing_requests(8).build(),
//!     "v1",
//!     true,
//!     "/",
//!     Arc::new(NoopControllerClient),
//!     NodeInfo::default(),
//! )?;
//! actor.initialize_and_get_metadata(None).await?;
//! # Ok(())
//! # }
//! ```

pub mod actor;
pub mod logging;
pub mod registry;
pub mod replica;

pub use actor::{AllocationInfo, NodeInfo, ReplicaActor, UnaryResult, WireChunk};
pub use registry::{InFlightRequest, RequestRegistry};
pub use replica::{HealthState, Replica, ReplicaMetadata, ResponseChunk};
