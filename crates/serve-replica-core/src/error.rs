//! Error taxonomy for the replica core.

/// Errors surfaced by user code.
///
/// User handlers report failures by kind, not type: designated
/// service-unavailable failures map to HTTP 503 at the ASGI boundary, all
/// other failures map to HTTP 500 (and are propagated as task errors on
/// non-HTTP paths).
#[derive(Debug, Clone, thiserror::Error)]
pub enum UserError {
    /// The deployment is temporarily unable to serve this request.
    #[error("{message}")]
    ServiceUnavailable { message: String },
    /// Any other unhandled failure in user code.
    #[error("{message}")]
    Failed { message: String },
}

impl UserError {
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Errors raised by the replica core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReplicaError {
    /// The requested call method was never registered on the deployment.
    #[error(
        "tried to call a method '{method}' that does not exist. \
         Available methods: {available:?}"
    )]
    MethodNotFound {
        method: String,
        available: Vec<String>,
    },

    /// A streaming method was invoked through the unary path.
    #[error(
        "method '{method}' returns a stream. You must use a streaming call \
         to invoke streaming methods on a deployment"
    )]
    StreamFromUnary { method: String },

    /// A unary method was invoked through the streaming path.
    #[error("called method '{method}' with a streaming call but it does not return a stream")]
    UnaryFromStream { method: String },

    /// An ASGI app method was invoked outside the HTTP path.
    #[error("method '{method}' is an ASGI app and can only be invoked over HTTP")]
    AsgiMethodOutsideHttp { method: String },

    /// `user_config` was supplied but the deployment registered no reconfigure hook.
    #[error("user_config was specified but deployment '{deployment}' has no reconfigure method")]
    MissingReconfigureHook { deployment: String },

    /// An operation requiring an initialized user callable ran before `initialize`.
    #[error("`initialize` must be called before `{operation}`")]
    NotInitialized { operation: String },

    /// Any failure during replica initialization, wrapping the original error.
    #[error("replica initialization failed: {message}")]
    Initialization { message: String },

    /// The request was cancelled cooperatively.
    #[error("request was cancelled")]
    Cancelled,

    /// The transport handed the facade a metadata blob it could not decode.
    #[error("failed to deserialize request metadata: {message}")]
    MetadataDeserialization { message: String },

    /// The user health check hook failed.
    #[error("replica health check failed: {message}")]
    HealthCheckFailed { message: String },

    /// An unhandled failure in user code.
    #[error(transparent)]
    User(#[from] UserError),
}

impl ReplicaError {
    /// True for failures that map to HTTP 503 at the ASGI boundary.
    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, ReplicaError::User(UserError::ServiceUnavailable { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_not_found_lists_available_methods() {
        let err = ReplicaError::MethodNotFound {
            method: "predict".to_string(),
            available: vec!["call".to_string(), "health".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("'predict'"));
        assert!(msg.contains("call"));
        assert!(msg.contains("health"));
    }

    #[test]
    fn service_unavailable_classification() {
        let err = ReplicaError::from(UserError::service_unavailable("overloaded"));
        assert!(err.is_service_unavailable());

        let err = ReplicaError::from(UserError::failed("boom"));
        assert!(!err.is_service_unavailable());

        assert!(!ReplicaError::Cancelled.is_service_unavailable());
    }
}
