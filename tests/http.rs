//! HTTP/ASGI path tests: default response wrapping, status capture, route
//! matching, error mapping, and the empty-handler edge case.

use futures::StreamExt;
use serve_replica::{Replica, ResponseChunk};
use serve_replica_callable::{
    AsgiReceive, Deployment, DeploymentFactory, HttpMessage, HttpRequest, HttpResponse,
    HttpScope, UserRequest, UserValue,
};
use serve_replica_core::context;
use serve_replica_core::{
    DeploymentConfig, DeploymentID, ReplicaID, RequestMetadata, RuntimeEnv, UserError,
};
use serve_replica_metrics::NoopControllerClient;
use std::sync::Arc;

fn replica_with(factory: DeploymentFactory) -> Replica {
    Replica::new(
        ReplicaID::new(DeploymentID::new("app", "model"), "replica-1"),
        factory,
        DeploymentConfig::builder().max_ongoing_requests(8).build(),
        "v1",
        true,
        "/",
        Arc::new(NoopControllerClient),
        RuntimeEnv {
            run_user_code_in_separate_loop: false,
            ..RuntimeEnv::default()
        },
    )
    .expect("replica construction")
}

fn http_metadata(method: &str) -> RequestMetadata {
    RequestMetadata::new("req-1", "internal-1", method).http()
}

fn http_request(scope: HttpScope) -> UserRequest {
    UserRequest::Http(HttpRequest::new(scope, AsgiReceive::empty()))
}

async fn collect_messages(replica: &Replica, metadata: RequestMetadata, scope: HttpScope) -> Vec<HttpMessage> {
    replica
        .handle_request_streaming(metadata, http_request(scope))
        .filter_map(|chunk| async move {
            match chunk {
                Ok(ResponseChunk::Http(messages)) => Some(futures::stream::iter(messages)),
                Ok(other) => panic!("unexpected chunk: {other:?}"),
                Err(error) => panic!("unexpected error: {error}"),
            }
        })
        .flatten()
        .collect()
        .await
}

#[tokio::test(flavor = "multi_thread")]
async fn plain_return_value_becomes_json_response() {
    let factory: DeploymentFactory = Box::new(|| {
        Box::pin(async {
            Ok(Deployment::builder()
                .method("call", |_request| async {
                    Ok(UserValue::json(serde_json::json!({"answer": 42})))
                })
                .build())
        })
    });
    let replica = replica_with(factory);
    replica.initialize(None).await.unwrap();

    let messages =
        collect_messages(&replica, http_metadata("call"), HttpScope::new("GET", "/")).await;
    match &messages[0] {
        HttpMessage::ResponseStart { status, headers } => {
            assert_eq!(*status, 200);
            assert!(headers
                .iter()
                .any(|(k, v)| k == "content-type" && v == "application/json"));
        }
        other => panic!("unexpected message: {other:?}"),
    }
    match &messages[1] {
        HttpMessage::ResponseBody { body, more_body } => {
            assert_eq!(&body[..], br#"{"answer":42}"#);
            assert!(!more_body);
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn explicit_response_passes_through() {
    let factory: DeploymentFactory = Box::new(|| {
        Box::pin(async {
            Ok(Deployment::builder()
                .method("call", |_request| async {
                    Ok(UserValue::Http(HttpResponse::text(201, "created")))
                })
                .build())
        })
    });
    let replica = replica_with(factory);
    replica.initialize(None).await.unwrap();

    let messages =
        collect_messages(&replica, http_metadata("call"), HttpScope::new("POST", "/")).await;
    assert!(matches!(
        &messages[0],
        HttpMessage::ResponseStart { status: 201, .. }
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn handler_without_parameters_is_invoked_without_request() {
    let factory: DeploymentFactory = Box::new(|| {
        Box::pin(async {
            Ok(Deployment::builder()
                .method_without_request("call", || async { Ok(UserValue::json("no args")) })
                .build())
        })
    });
    let replica = replica_with(factory);
    replica.initialize(None).await.unwrap();

    let messages =
        collect_messages(&replica, http_metadata("call"), HttpScope::new("GET", "/")).await;
    assert!(matches!(
        &messages[0],
        HttpMessage::ResponseStart { status: 200, .. }
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn service_unavailable_maps_to_503() {
    let factory: DeploymentFactory = Box::new(|| {
        Box::pin(async {
            Ok(Deployment::builder()
                .method("call", |_request| async {
                    Err::<UserValue, _>(UserError::service_unavailable("try later"))
                })
                .build())
        })
    });
    let replica = replica_with(factory);
    replica.initialize(None).await.unwrap();

    let chunks: Vec<_> = replica
        .handle_request_streaming(http_metadata("call"), http_request(HttpScope::new("GET", "/")))
        .collect()
        .await;

    // The error response is delivered over ASGI, then the failure itself is
    // surfaced so the transport records a task error.
    let mut statuses = Vec::new();
    let mut saw_error = false;
    for chunk in chunks {
        match chunk {
            Ok(ResponseChunk::Http(messages)) => {
                for message in messages {
                    if let HttpMessage::ResponseStart { status, .. } = message {
                        statuses.push(status);
                    }
                }
            }
            Ok(other) => panic!("unexpected chunk: {other:?}"),
            Err(_) => saw_error = true,
        }
    }
    assert_eq!(statuses, vec![503]);
    assert!(saw_error);
}

#[tokio::test(flavor = "multi_thread")]
async fn unhandled_error_maps_to_500() {
    let factory: DeploymentFactory = Box::new(|| {
        Box::pin(async {
            Ok(Deployment::builder()
                .method("call", |_request| async {
                    Err::<UserValue, _>(UserError::failed("boom"))
                })
                .build())
        })
    });
    let replica = replica_with(factory);
    replica.initialize(None).await.unwrap();

    let chunks: Vec<_> = replica
        .handle_request_streaming(http_metadata("call"), http_request(HttpScope::new("GET", "/")))
        .collect()
        .await;
    let first_status = chunks.iter().find_map(|chunk| match chunk {
        Ok(ResponseChunk::Http(messages)) => messages.iter().find_map(|m| match m {
            HttpMessage::ResponseStart { status, .. } => Some(*status),
            _ => None,
        }),
        _ => None,
    });
    assert_eq!(first_status, Some(500));
}

#[tokio::test(flavor = "multi_thread")]
async fn asgi_app_streams_its_own_messages() {
    let factory: DeploymentFactory = Box::new(|| {
        Box::pin(async {
            Ok(Deployment::builder()
                .asgi_app(|scope, _receive, send| async move {
                    send(HttpMessage::ResponseStart {
                        status: 200,
                        headers: vec![("content-type".to_string(), "text/plain".to_string())],
                    });
                    send(HttpMessage::ResponseBody {
                        body: bytes::Bytes::from(format!("hello {}", scope.path)),
                        more_body: false,
                    });
                    Ok(())
                })
                .asgi_route("/users/{id}")
                .build())
        })
    });
    let replica = replica_with(factory);
    replica.initialize(None).await.unwrap();

    let messages = collect_messages(
        &replica,
        http_metadata("__call__"),
        HttpScope::new("GET", "/users/42"),
    )
    .await;
    assert!(matches!(
        &messages[0],
        HttpMessage::ResponseStart { status: 200, .. }
    ));
    match &messages[1] {
        HttpMessage::ResponseBody { body, .. } => {
            assert_eq!(&body[..], b"hello /users/42");
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn matched_route_is_visible_in_request_context() {
    let factory: DeploymentFactory = Box::new(|| {
        Box::pin(async {
            Ok(Deployment::builder()
                .asgi_app(|_scope, _receive, send| async move {
                    let route = context::current_request_context()
                        .map(|ctx| ctx.route)
                        .unwrap_or_default();
                    send(HttpMessage::ResponseStart {
                        status: 200,
                        headers: Vec::new(),
                    });
                    send(HttpMessage::ResponseBody {
                        body: bytes::Bytes::from(route),
                        more_body: false,
                    });
                    Ok(())
                })
                .asgi_route("/users/{id}")
                .build())
        })
    });
    let replica = replica_with(factory);
    replica.initialize(None).await.unwrap();

    let metadata = http_metadata("__call__").with_route("/fallback");
    let messages =
        collect_messages(&replica, metadata, HttpScope::new("GET", "/users/7")).await;
    match &messages[1] {
        HttpMessage::ResponseBody { body, .. } => {
            // The router match replaced the route from the incoming metadata.
            assert_eq!(&body[..], b"/users/{id}");
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn unmatched_route_keeps_incoming_metadata_route() {
    let factory: DeploymentFactory = Box::new(|| {
        Box::pin(async {
            Ok(Deployment::builder()
                .asgi_app(|_scope, _receive, send| async move {
                    let route = context::current_request_context()
                        .map(|ctx| ctx.route)
                        .unwrap_or_default();
                    send(HttpMessage::ResponseStart {
                        status: 200,
                        headers: Vec::new(),
                    });
                    send(HttpMessage::ResponseBody {
                        body: bytes::Bytes::from(route),
                        more_body: false,
                    });
                    Ok(())
                })
                .asgi_route("/users/{id}")
                .build())
        })
    });
    let replica = replica_with(factory);
    replica.initialize(None).await.unwrap();

    let metadata = http_metadata("__call__").with_route("/prefix");
    let messages =
        collect_messages(&replica, metadata, HttpScope::new("GET", "/other/path/here")).await;
    match &messages[1] {
        HttpMessage::ResponseBody { body, .. } => {
            assert_eq!(&body[..], b"/prefix");
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn streaming_handler_over_http_emits_body_chunks() {
    let factory: DeploymentFactory = Box::new(|| {
        Box::pin(async {
            Ok(Deployment::builder()
                .stream_method("stream", |_request| {
                    futures::stream::iter(vec![
                        Ok(UserValue::bytes(&b"one"[..])),
                        Ok(UserValue::bytes(&b"two"[..])),
                    ])
                })
                .build())
        })
    });
    let replica = replica_with(factory);
    replica.initialize(None).await.unwrap();

    let messages =
        collect_messages(&replica, http_metadata("stream"), HttpScope::new("GET", "/")).await;
    assert!(matches!(
        &messages[0],
        HttpMessage::ResponseStart { status: 200, .. }
    ));
    let bodies: Vec<&[u8]> = messages
        .iter()
        .filter_map(|m| match m {
            HttpMessage::ResponseBody { body, more_body: true } => Some(&body[..]),
            _ => None,
        })
        .collect();
    assert_eq!(bodies, vec![&b"one"[..], &b"two"[..]]);
    assert!(matches!(
        messages.last(),
        Some(HttpMessage::ResponseBody { more_body: false, .. })
    ));
}
