//! Facade tests: wire round-trips, allocation info, rejection framing, the
//! legacy metadata encoding, and misuse errors.

use bytes::Bytes;
use futures::StreamExt;
use serve_replica::{NodeInfo, ReplicaActor, WireChunk};
use serve_replica_callable::{Deployment, DeploymentFactory, UserRequest, UserValue};
use serve_replica_core::{
    DeploymentConfig, DeploymentID, GrpcContext, LegacyRequestMetadata, ReplicaError, ReplicaID,
    RequestMetadata,
};
use serve_replica_metrics::NoopControllerClient;
use std::sync::Arc;

fn actor_with(factory: DeploymentFactory) -> ReplicaActor {
    ReplicaActor::new(
        ReplicaID::new(DeploymentID::new("app", "model"), "replica-1"),
        factory,
        DeploymentConfig::builder().max_ongoing_requests(4).build(),
        "v1",
        true,
        "/",
        Arc::new(NoopControllerClient),
        NodeInfo {
            actor_id: "actor-1".to_string(),
            worker_id: "worker-1".to_string(),
            node_id: "node-1".to_string(),
            node_ip: "10.0.0.1".to_string(),
            node_instance_id: "instance-1".to_string(),
        },
    )
    .expect("actor construction")
}

fn simple_factory() -> DeploymentFactory {
    Box::new(|| {
        Box::pin(async {
            Ok(Deployment::builder()
                .method("call", |_request| async { Ok(UserValue::json("Success!")) })
                .blocking_method("predict", |request| {
                    let UserRequest::Grpc { message, context } = request else {
                        return Err(serve_replica_core::UserError::failed("expected grpc"));
                    };
                    assert!(context.is_some());
                    Ok(UserValue::bytes(message))
                })
                .takes_grpc_context("predict")
                .stream_method("stream", |_request| {
                    futures::stream::iter(vec![Ok(UserValue::json(1)), Ok(UserValue::json(2))])
                })
                .build())
        })
    })
}

fn metadata_blob(metadata: &RequestMetadata) -> Vec<u8> {
    serde_json::to_vec(metadata).unwrap()
}

#[test]
fn request_metadata_round_trips_all_core_fields() {
    let metadata = RequestMetadata::new("req-1", "internal-1", "predict")
        .with_route("/predict")
        .with_multiplexed_model_id("model-a")
        .grpc(GrpcContext::default())
        .streaming();

    let blob = metadata_blob(&metadata);
    let decoded: RequestMetadata = serde_json::from_slice(&blob).unwrap();
    assert_eq!(decoded, metadata);
}

#[tokio::test(flavor = "multi_thread")]
async fn is_allocated_reports_worker_identity_without_user_code() {
    // The factory hangs forever: is_allocated must still answer.
    let factory: DeploymentFactory = Box::new(|| Box::pin(futures::future::pending()));
    let actor = actor_with(factory);

    let info = actor.is_allocated();
    assert_eq!(info.pid, std::process::id());
    assert_eq!(info.actor_id, "actor-1");
    assert_eq!(info.node_ip, "10.0.0.1");
    assert_eq!(actor.get_num_ongoing_requests(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn unary_request_through_the_wire() {
    let actor = actor_with(simple_factory());
    actor.initialize_and_get_metadata(None).await.unwrap();

    let metadata = RequestMetadata::new("req-1", "internal-1", "call");
    let result = actor
        .handle_request(&metadata_blob(&metadata), UserRequest::empty())
        .await
        .unwrap();
    assert_eq!(result.value, UserValue::json("Success!"));
    assert!(result.grpc_context.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn grpc_result_is_paired_with_call_context() {
    let actor = actor_with(simple_factory());
    actor.initialize_and_get_metadata(None).await.unwrap();

    let mut grpc_context = GrpcContext::default();
    grpc_context.peer = Some("peer-1".to_string());
    let metadata =
        RequestMetadata::new("req-1", "internal-1", "predict").grpc(grpc_context.clone());
    let result = actor
        .handle_request(
            &metadata_blob(&metadata),
            UserRequest::Grpc {
                message: Bytes::from_static(b"payload"),
                context: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(result.grpc_context, Some(grpc_context));
    assert_eq!(result.value, UserValue::bytes(&b"payload"[..]));
}

#[tokio::test(flavor = "multi_thread")]
async fn streaming_frames_decode_in_order() {
    let actor = actor_with(simple_factory());
    actor.initialize_and_get_metadata(None).await.unwrap();

    let metadata = RequestMetadata::new("req-1", "internal-1", "stream").streaming();
    let frames: Vec<Bytes> = actor
        .handle_request_streaming(&metadata_blob(&metadata), UserRequest::empty())
        .unwrap()
        .map(|frame| frame.unwrap())
        .collect()
        .await;

    let decoded: Vec<WireChunk> = frames
        .iter()
        .map(|frame| serde_json::from_slice(frame).unwrap())
        .collect();
    assert_eq!(
        decoded,
        vec![
            WireChunk::Item(UserValue::json(1)),
            WireChunk::Item(UserValue::json(2)),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn rejection_stream_begins_with_system_message() {
    let actor = actor_with(simple_factory());
    actor.initialize_and_get_metadata(None).await.unwrap();

    let metadata = RequestMetadata::new("req-1", "internal-1", "call");
    let frames: Vec<Bytes> = actor
        .handle_request_with_rejection(&metadata_blob(&metadata), UserRequest::empty())
        .unwrap()
        .map(|frame| frame.unwrap())
        .collect()
        .await;
    assert_eq!(frames.len(), 2);

    let first: WireChunk = serde_json::from_slice(&frames[0]).unwrap();
    match first {
        WireChunk::QueueLength(info) => {
            assert!(info.accepted);
            assert_eq!(info.num_ongoing_requests, 1);
        }
        other => panic!("unexpected first frame: {other:?}"),
    }
    let second: WireChunk = serde_json::from_slice(&frames[1]).unwrap();
    assert_eq!(second, WireChunk::Item(UserValue::json("Success!")));
}

#[tokio::test(flavor = "multi_thread")]
async fn legacy_metadata_encoding_is_upconverted() {
    let actor = actor_with(simple_factory());
    actor.initialize_and_get_metadata(None).await.unwrap();

    let legacy = LegacyRequestMetadata {
        request_id: "req-1".to_string(),
        internal_request_id: "internal-1".to_string(),
        call_method: "call".to_string(),
        multiplexed_model_id: String::new(),
        route: "/legacy".to_string(),
    };
    let blob = serde_json::to_vec(&legacy).unwrap();
    let result = actor
        .handle_request_from_java(&blob, UserRequest::empty())
        .await
        .unwrap();
    assert_eq!(result.value, UserValue::json("Success!"));
}

#[tokio::test(flavor = "multi_thread")]
async fn garbage_metadata_is_a_deserialization_error() {
    let actor = actor_with(simple_factory());
    actor.initialize_and_get_metadata(None).await.unwrap();

    let err = actor
        .handle_request(b"not json", UserRequest::empty())
        .await
        .unwrap_err();
    assert!(matches!(err, ReplicaError::MetadataDeserialization { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn misuse_errors_surface_before_user_work() {
    let actor = actor_with(simple_factory());
    actor.initialize_and_get_metadata(None).await.unwrap();

    // Streaming method through the unary entrypoint.
    let metadata = RequestMetadata::new("req-1", "internal-1", "stream");
    let err = actor
        .handle_request(&metadata_blob(&metadata), UserRequest::empty())
        .await
        .unwrap_err();
    assert!(matches!(err, ReplicaError::StreamFromUnary { .. }));

    // Unary method through the streaming entrypoint.
    let metadata = RequestMetadata::new("req-2", "internal-2", "call").streaming();
    let chunks: Vec<_> = actor
        .handle_request_streaming(&metadata_blob(&metadata), UserRequest::empty())
        .unwrap()
        .collect()
        .await;
    assert_eq!(chunks.len(), 1);
    assert!(matches!(
        chunks[0].as_ref().unwrap_err(),
        ReplicaError::UnaryFromStream { .. }
    ));

    // A method that does not exist names the registered ones.
    let metadata = RequestMetadata::new("req-3", "internal-3", "missing");
    let err = actor
        .handle_request(&metadata_blob(&metadata), UserRequest::empty())
        .await
        .unwrap_err();
    match err {
        ReplicaError::MethodNotFound { method, available } => {
            assert_eq!(method, "missing");
            assert_eq!(available, vec!["call", "predict", "stream"]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn serialized_config_constructor_round_trips() {
    let config = DeploymentConfig::builder().max_ongoing_requests(7).build();
    let config_blob = serde_json::to_vec(&config).unwrap();

    let actor = ReplicaActor::from_serialized_config(
        ReplicaID::new(DeploymentID::new("app", "model"), "replica-1"),
        simple_factory(),
        &config_blob,
        "v1",
        true,
        "/",
        Arc::new(NoopControllerClient),
        NodeInfo::default(),
    )
    .unwrap();

    let replica_metadata = actor.initialize_and_get_metadata(None).await.unwrap();
    assert_eq!(replica_metadata.deployment_config.max_ongoing_requests, 7);
    assert_eq!(replica_metadata.version.code_version, "v1");
}
