//! ASGI-shaped HTTP types exchanged between the proxy, the plane, and user
//! code.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Connection scope describing one incoming HTTP request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpScope {
    pub method: String,
    pub path: String,
    pub query_string: String,
    pub headers: Vec<(String, String)>,
}

impl HttpScope {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            query_string: String::new(),
            headers: Vec::new(),
        }
    }

    pub fn with_query_string(mut self, query: impl Into<String>) -> Self {
        self.query_string = query.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// One message of an HTTP response stream.
///
/// Responses begin with exactly one `ResponseStart` carrying the status code;
/// other response types (e.g. WebSockets) may not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HttpMessage {
    ResponseStart {
        status: u16,
        headers: Vec<(String, String)>,
    },
    ResponseBody {
        body: Bytes,
        more_body: bool,
    },
}

/// A complete HTTP response as returned by non-ASGI user handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Plain-text response with the given status.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("content-type", "text/plain; charset=utf-8")
            .with_body(body.into())
    }

    /// JSON response serializing `value`.
    pub fn json(value: &Value) -> Self {
        // Serializing a `Value` cannot produce invalid JSON.
        let body = serde_json::to_vec(value).unwrap_or_default();
        Self::new(200)
            .with_header("content-type", "application/json")
            .with_body(body)
    }

    /// Renders the response as its ASGI message sequence.
    pub fn messages(&self) -> Vec<HttpMessage> {
        vec![
            HttpMessage::ResponseStart {
                status: self.status,
                headers: self.headers.clone(),
            },
            HttpMessage::ResponseBody {
                body: self.body.clone(),
                more_body: false,
            },
        ]
    }
}

/// Sink through which user code emits response messages.
///
/// Enqueues are thread-safe, so the same sink works from the user loop and
/// from worker threads running blocking methods.
pub type AsgiSend = Arc<dyn Fn(HttpMessage) + Send + Sync>;

/// Receive side of the request body stream.
pub struct AsgiReceive {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl AsgiReceive {
    /// Creates a connected sender/receiver pair. The proxy feeds body chunks
    /// through the sender as they arrive from the client.
    pub fn channel() -> (mpsc::UnboundedSender<Bytes>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// A receive side carrying a single, fully buffered body.
    pub fn from_body(body: impl Into<Bytes>) -> Self {
        let (tx, receive) = Self::channel();
        let _ = tx.send(body.into());
        receive
    }

    /// A receive side with no body.
    pub fn empty() -> Self {
        let (_tx, rx) = mpsc::unbounded_channel();
        Self { rx }
    }

    /// Next body chunk, or `None` once the client is done sending.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Collects the remaining chunks into one buffer.
    pub async fn body(mut self) -> Bytes {
        let mut collected = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            collected.extend_from_slice(&chunk);
        }
        Bytes::from(collected)
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<Bytes> {
        UnboundedReceiverStream::new(self.rx)
    }
}

impl std::fmt::Debug for AsgiReceive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsgiReceive").finish_non_exhaustive()
    }
}

/// Minimal request object handed to non-ASGI HTTP handlers.
#[derive(Debug)]
pub struct HttpRequest {
    pub scope: HttpScope,
    pub receive: AsgiReceive,
}

impl HttpRequest {
    pub fn new(scope: HttpScope, receive: AsgiReceive) -> Self {
        Self { scope, receive }
    }
}

/// Matches `path` against router patterns, returning the matched pattern.
///
/// Patterns are slash-separated with `{param}` segments matching any single
/// path segment. Used to refine the route recorded in logs and metric tags.
pub fn match_route(patterns: &[String], path: &str) -> Option<String> {
    let path_segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    patterns
        .iter()
        .find(|pattern| {
            let pattern_segments: Vec<&str> = pattern.trim_matches('/').split('/').collect();
            pattern_segments.len() == path_segments.len()
                && pattern_segments
                    .iter()
                    .zip(&path_segments)
                    .all(|(p, s)| (p.starts_with('{') && p.ends_with('}')) || p == s)
        })
        .cloned()
}
