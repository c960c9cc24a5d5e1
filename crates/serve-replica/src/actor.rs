//! The replica actor facade: the external RPC surface.
//!
//! Deserializes request metadata from its transport representation,
//! dispatches into the [`Replica`] core, and serializes results back out.
//! Wire framing here is one blob per yielded chunk; the serialization format
//! of user payloads themselves belongs to the transport.

use crate::replica::{Replica, ReplicaMetadata, ResponseChunk};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serve_replica_callable::{DeploymentFactory, UserRequest, UserValue};
use serve_replica_core::{
    DeploymentConfig, GrpcContext, LegacyRequestMetadata, ReplicaError, ReplicaID,
    ReplicaQueueLengthInfo, RequestMetadata, RuntimeEnv, UserError,
};
use serve_replica_metrics::ControllerClient;
use std::sync::Arc;

/// Identity of the worker process and node hosting this replica.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub actor_id: String,
    pub worker_id: String,
    pub node_id: String,
    pub node_ip: String,
    pub node_instance_id: String,
}

/// Returned by `is_allocated` so the controller can detect worker-slot
/// allocation without blocking on user code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationInfo {
    pub pid: u32,
    pub actor_id: String,
    pub worker_id: String,
    pub node_id: String,
    pub node_ip: String,
    pub node_instance_id: String,
    pub log_file_path: Option<String>,
}

/// A unary result paired with the gRPC call context on the gRPC path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnaryResult {
    pub grpc_context: Option<GrpcContext>,
    pub value: UserValue,
}

/// One serialized frame of a streaming response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireChunk {
    QueueLength(ReplicaQueueLengthInfo),
    Http(Vec<serve_replica_callable::HttpMessage>),
    Item(UserValue),
    Grpc {
        context: Option<GrpcContext>,
        payload: UserValue,
    },
}

/// The interface the controller and deployment handles use to interact with
/// a replica. All interaction with the user-provided deployment goes through
/// the replica core.
pub struct ReplicaActor {
    replica: Replica,
    node_info: NodeInfo,
}

impl ReplicaActor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        replica_id: ReplicaID,
        factory: DeploymentFactory,
        deployment_config: DeploymentConfig,
        code_version: impl Into<String>,
        ingress: bool,
        route_prefix: impl Into<String>,
        controller: Arc<dyn ControllerClient>,
        node_info: NodeInfo,
    ) -> Result<Self, ReplicaError> {
        let replica = Replica::new(
            replica_id,
            factory,
            deployment_config,
            code_version,
            ingress,
            route_prefix,
            controller,
            RuntimeEnv::from_env(),
        )?;
        Ok(Self { replica, node_info })
    }

    /// Constructor variant taking the deployment config in its serialized
    /// transport representation.
    #[allow(clippy::too_many_arguments)]
    pub fn from_serialized_config(
        replica_id: ReplicaID,
        factory: DeploymentFactory,
        deployment_config_bytes: &[u8],
        code_version: impl Into<String>,
        ingress: bool,
        route_prefix: impl Into<String>,
        controller: Arc<dyn ControllerClient>,
        node_info: NodeInfo,
    ) -> Result<Self, ReplicaError> {
        let deployment_config: DeploymentConfig = serde_json::from_slice(deployment_config_bytes)
            .map_err(|error| ReplicaError::Initialization {
            message: format!("failed to deserialize deployment config: {error}"),
        })?;
        Self::new(
            replica_id,
            factory,
            deployment_config,
            code_version,
            ingress,
            route_prefix,
            controller,
            node_info,
        )
    }

    /// The underlying replica core.
    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    /// Pokes the replica to check whether it is alive.
    ///
    /// Completes as soon as the actor is running, independent of user-code
    /// initialization, so the controller can transition the replica out of
    /// its pending-allocation state.
    pub fn is_allocated(&self) -> AllocationInfo {
        AllocationInfo {
            pid: std::process::id(),
            actor_id: self.node_info.actor_id.clone(),
            worker_id: self.node_info.worker_id.clone(),
            node_id: self.node_info.node_id.clone(),
            node_ip: self.node_info.node_ip.clone(),
            node_instance_id: self.node_info.node_instance_id.clone(),
            log_file_path: crate::logging::component_log_file_path(),
        }
    }

    /// Initializes the replica and returns its metadata.
    pub async fn initialize_and_get_metadata(
        &self,
        deployment_config: Option<DeploymentConfig>,
    ) -> Result<ReplicaMetadata, ReplicaError> {
        self.replica.initialize(deployment_config).await?;
        Ok(self.replica.metadata())
    }

    pub async fn reconfigure(
        &self,
        deployment_config: DeploymentConfig,
    ) -> Result<ReplicaMetadata, ReplicaError> {
        self.replica.reconfigure(deployment_config).await?;
        Ok(self.replica.metadata())
    }

    pub async fn check_health(&self) -> Result<(), ReplicaError> {
        self.replica.check_health().await
    }

    pub async fn record_routing_stats(
        &self,
    ) -> Result<serde_json::Map<String, serde_json::Value>, ReplicaError> {
        self.replica.record_routing_stats().await
    }

    /// Queue length of this replica. Backed by an atomic counter, so it can
    /// never be blocked by user work.
    pub fn get_num_ongoing_requests(&self) -> usize {
        self.replica.get_num_ongoing_requests()
    }

    fn deserialize_metadata(metadata_blob: &[u8]) -> Result<RequestMetadata, ReplicaError> {
        serde_json::from_slice(metadata_blob).map_err(|error| {
            ReplicaError::MetadataDeserialization {
                message: error.to_string(),
            }
        })
    }

    /// Entrypoint for unary calls.
    pub async fn handle_request(
        &self,
        metadata_blob: &[u8],
        request: UserRequest,
    ) -> Result<UnaryResult, ReplicaError> {
        let metadata = Self::deserialize_metadata(metadata_blob)?;
        self.handle_request_inner(metadata, request).await
    }

    /// Entrypoint for unary calls with the legacy positional metadata
    /// encoding.
    pub async fn handle_request_from_java(
        &self,
        metadata_blob: &[u8],
        request: UserRequest,
    ) -> Result<UnaryResult, ReplicaError> {
        let legacy: LegacyRequestMetadata = serde_json::from_slice(metadata_blob).map_err(
            |error| ReplicaError::MetadataDeserialization {
                message: error.to_string(),
            },
        )?;
        self.handle_request_inner(legacy.into(), request).await
    }

    async fn handle_request_inner(
        &self,
        metadata: RequestMetadata,
        request: UserRequest,
    ) -> Result<UnaryResult, ReplicaError> {
        let grpc_context = metadata
            .is_grpc_request
            .then(|| metadata.grpc_context.clone())
            .flatten();
        let value = self.replica.handle_request(metadata, request).await?;
        Ok(UnaryResult {
            grpc_context,
            value,
        })
    }

    /// Entrypoint for streaming calls. Each yielded blob frames one chunk.
    pub fn handle_request_streaming(
        &self,
        metadata_blob: &[u8],
        request: UserRequest,
    ) -> Result<BoxStream<'static, Result<Bytes, ReplicaError>>, ReplicaError> {
        let metadata = Self::deserialize_metadata(metadata_blob)?;
        let is_grpc = metadata.is_grpc_request;
        let grpc_context = metadata.grpc_context.clone();
        let chunks = self.replica.handle_request_streaming(metadata, request);
        Ok(serialize_chunks(chunks, is_grpc, grpc_context))
    }

    /// Entrypoint for calls with strict `max_ongoing_requests` enforcement.
    ///
    /// The first blob always frames the system message advertising
    /// acceptance; a rejected request yields nothing else.
    pub fn handle_request_with_rejection(
        &self,
        metadata_blob: &[u8],
        request: UserRequest,
    ) -> Result<BoxStream<'static, Result<Bytes, ReplicaError>>, ReplicaError> {
        let metadata = Self::deserialize_metadata(metadata_blob)?;
        let is_grpc = metadata.is_grpc_request;
        let grpc_context = metadata.grpc_context.clone();
        let chunks = self.replica.handle_request_with_rejection(metadata, request);
        Ok(serialize_chunks(chunks, is_grpc, grpc_context))
    }

    pub async fn perform_graceful_shutdown(&self) {
        self.replica.perform_graceful_shutdown().await;
    }
}

fn serialize_chunks(
    chunks: BoxStream<'static, Result<ResponseChunk, ReplicaError>>,
    is_grpc: bool,
    grpc_context: Option<GrpcContext>,
) -> BoxStream<'static, Result<Bytes, ReplicaError>> {
    chunks
        .map(move |chunk| {
            let wire = match chunk? {
                ResponseChunk::QueueLength(info) => WireChunk::QueueLength(info),
                ResponseChunk::Http(messages) => WireChunk::Http(messages),
                ResponseChunk::Item(value) if is_grpc => WireChunk::Grpc {
                    context: grpc_context.clone(),
                    payload: value,
                },
                ResponseChunk::Item(value) => WireChunk::Item(value),
            };
            serialize_frame(&wire)
        })
        .boxed()
}

fn serialize_frame(wire: &WireChunk) -> Result<Bytes, ReplicaError> {
    serde_json::to_vec(wire)
        .map(Bytes::from)
        .map_err(|error| {
            ReplicaError::User(UserError::failed(format!(
                "failed to serialize response chunk: {error}"
            )))
        })
}
