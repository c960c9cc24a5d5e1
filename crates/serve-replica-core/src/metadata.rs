//! Per-request metadata and the queue-length system message.

use serde::{Deserialize, Serialize};

/// Call context carried alongside gRPC requests.
///
/// The transport owns serialization of the actual wire message; this struct
/// carries the pieces of the call context the core and user code observe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrpcContext {
    pub peer: Option<String>,
    pub invocation_metadata: Vec<(String, String)>,
    pub code: Option<u32>,
    pub details: Option<String>,
}

impl GrpcContext {
    pub fn set_code(&mut self, code: u32) {
        self.code = Some(code);
    }

    pub fn set_details(&mut self, details: impl Into<String>) {
        self.details = Some(details.into());
    }
}

/// Metadata describing a single request, deserialized from the transport.
///
/// Immutable per request except for `route` and `http_method`, which the core
/// refines after matching the request against the ASGI router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub request_id: String,
    pub internal_request_id: String,
    pub call_method: String,
    pub route: String,
    pub multiplexed_model_id: String,
    pub is_http_request: bool,
    pub is_grpc_request: bool,
    pub is_streaming: bool,
    pub grpc_context: Option<GrpcContext>,
    pub http_method: Option<String>,
}

impl RequestMetadata {
    pub fn new(
        request_id: impl Into<String>,
        internal_request_id: impl Into<String>,
        call_method: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            internal_request_id: internal_request_id.into(),
            call_method: call_method.into(),
            route: String::new(),
            multiplexed_model_id: String::new(),
            is_http_request: false,
            is_grpc_request: false,
            is_streaming: false,
            grpc_context: None,
            http_method: None,
        }
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = route.into();
        self
    }

    pub fn with_multiplexed_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.multiplexed_model_id = model_id.into();
        self
    }

    pub fn http(mut self) -> Self {
        self.is_http_request = true;
        // All HTTP requests go through the streaming codepath.
        self.is_streaming = true;
        self
    }

    pub fn grpc(mut self, context: GrpcContext) -> Self {
        self.is_grpc_request = true;
        self.grpc_context = Some(context);
        self
    }

    pub fn streaming(mut self) -> Self {
        self.is_streaming = true;
        self
    }
}

/// Legacy positional metadata frame used by the alternate-encoding entrypoint.
///
/// Carries only the fields that encoding defines; everything else takes the
/// [`RequestMetadata`] defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyRequestMetadata {
    pub request_id: String,
    pub internal_request_id: String,
    pub call_method: String,
    pub multiplexed_model_id: String,
    pub route: String,
}

impl From<LegacyRequestMetadata> for RequestMetadata {
    fn from(legacy: LegacyRequestMetadata) -> Self {
        RequestMetadata::new(
            legacy.request_id,
            legacy.internal_request_id,
            legacy.call_method,
        )
        .with_route(legacy.route)
        .with_multiplexed_model_id(legacy.multiplexed_model_id)
    }
}

/// System message returned to the router under the rejection protocol.
///
/// Always the first message of a `handle_request_with_rejection` stream; when
/// `accepted` is false it is the only message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaQueueLengthInfo {
    pub accepted: bool,
    pub num_ongoing_requests: usize,
}
