//! # Error Handling Module
//!
//! Every fallible operation in the aggregator returns [`AggregatorResult`]. The
//! error enum carries enough structure for two consumers:
//!
//! - the registration controller, which only needs to tell a registry miss
//!   (`NotFound`, meaning "remove this backend") apart from everything else
//!   (requeue with backoff);
//! - HTTP handlers, which turn an error into a JSON body with a status code
//!   through the `IntoResponse` implementation below.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::convert::Infallible;
use thiserror::Error;

/// Result type used throughout the aggregator
pub type AggregatorResult<T> = Result<T, AggregatorError>;

/// Error types for the aggregator
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AggregatorError {
    /// Invalid or unreadable configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The named object does not exist (registry miss, unknown route, empty group)
    #[error("{resource} \"{name}\" not found")]
    NotFound { resource: String, name: String },

    /// An object with the same name is already stored
    #[error("{resource} \"{name}\" already exists")]
    AlreadyExists { resource: String, name: String },

    /// Object validation failed; every problem found is listed
    #[error("{resource} \"{name}\" is invalid: {}", errors.join("; "))]
    Validation {
        resource: String,
        name: String,
        errors: Vec<String>,
    },

    /// Malformed client request
    #[error("Bad request: {reason}")]
    BadRequest { reason: String },

    #[error("Method {method} not allowed on {path}")]
    MethodNotAllowed { method: String, path: String },

    /// No credentials, or credentials that do not map to a user
    #[error("Authentication failed: {reason}")]
    Unauthenticated { reason: String },

    /// The request reached a proxy without an authenticated caller attached
    #[error("Missing caller identity: {reason}")]
    MissingIdentity { reason: String },

    /// A pattern was registered twice in the path multiplexer
    #[error("Route pattern {pattern} is already registered")]
    RouteConflict { pattern: String },

    /// Transient failure of the backend registry
    #[error("Registry error: {message}")]
    Registry { message: String },

    /// Building the transport (TLS roots, client identity) for a backend failed
    #[error("Transport error for backend {backend}: {message}")]
    Transport { backend: String, message: String },

    /// The backend could not be reached or broke the exchange
    #[error("Backend {backend} unavailable: {message}")]
    Upstream { backend: String, message: String },

    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("I/O error: {message}")]
    Io { message: String },

    #[error("JSON error: {message}")]
    Json { message: String },

    #[error("YAML error: {message}")]
    Yaml { message: String },
}

impl AggregatorError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a not found error for a resource kind and name
    pub fn not_found<R: Into<String>, N: Into<String>>(resource: R, name: N) -> Self {
        Self::NotFound {
            resource: resource.into(),
            name: name.into(),
        }
    }

    pub fn already_exists<R: Into<String>, N: Into<String>>(resource: R, name: N) -> Self {
        Self::AlreadyExists {
            resource: resource.into(),
            name: name.into(),
        }
    }

    /// Create a validation error from the list of problems found
    pub fn validation<R: Into<String>, N: Into<String>>(
        resource: R,
        name: N,
        errors: Vec<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            name: name.into(),
            errors,
        }
    }

    pub fn bad_request<S: Into<String>>(reason: S) -> Self {
        Self::BadRequest {
            reason: reason.into(),
        }
    }

    pub fn unauthenticated<S: Into<String>>(reason: S) -> Self {
        Self::Unauthenticated {
            reason: reason.into(),
        }
    }

    pub fn missing_identity<S: Into<String>>(reason: S) -> Self {
        Self::MissingIdentity {
            reason: reason.into(),
        }
    }

    pub fn registry<S: Into<String>>(message: S) -> Self {
        Self::Registry {
            message: message.into(),
        }
    }

    pub fn transport<B: Into<String>, S: Into<String>>(backend: B, message: S) -> Self {
        Self::Transport {
            backend: backend.into(),
            message: message.into(),
        }
    }

    pub fn upstream<B: Into<String>, S: Into<String>>(backend: B, message: S) -> Self {
        Self::Upstream {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for registry misses. The controller maps this to backend removal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::AlreadyExists { .. } => StatusCode::CONFLICT,
            Self::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Self::Registry { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::MissingIdentity { .. }
            | Self::RouteConflict { .. }
            | Self::Transport { .. }
            | Self::Configuration { .. }
            | Self::Internal { .. }
            | Self::Io { .. }
            | Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if the failed operation may succeed when retried unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Registry { .. } | Self::Upstream { .. } | Self::Io { .. }
        )
    }

    /// Get a string representation of the error type for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::NotFound { .. } => "not_found",
            Self::AlreadyExists { .. } => "already_exists",
            Self::Validation { .. } => "validation_error",
            Self::BadRequest { .. } => "bad_request",
            Self::MethodNotAllowed { .. } => "method_not_allowed",
            Self::Unauthenticated { .. } => "authentication_error",
            Self::MissingIdentity { .. } => "missing_identity",
            Self::RouteConflict { .. } => "route_conflict",
            Self::Registry { .. } => "registry_error",
            Self::Transport { .. } => "transport_error",
            Self::Upstream { .. } => "upstream_unavailable",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
        }
    }
}

impl From<Infallible> for AggregatorError {
    fn from(infallible: Infallible) -> Self {
        match infallible {}
    }
}

impl From<std::io::Error> for AggregatorError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for AggregatorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for AggregatorError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

/// Errors render as `{"error": {"code", "message", "type", "retryable"}}`
impl IntoResponse for AggregatorError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error_response = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
                "retryable": self.is_retryable(),
            }
        });

        (status, Json(error_response)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            AggregatorError::not_found("backend", "v1.foo").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AggregatorError::missing_identity("missing user").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AggregatorError::upstream("v1.foo", "connection refused").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AggregatorError::validation("backend", "x", vec!["bad".into()]).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn test_not_found_is_distinguishable() {
        assert!(AggregatorError::not_found("backend", "v1.foo").is_not_found());
        assert!(!AggregatorError::registry("timeout").is_not_found());
        assert!(AggregatorError::registry("timeout").is_retryable());
    }

    #[test]
    fn test_validation_message_lists_every_problem() {
        let err = AggregatorError::validation(
            "backend",
            "v1.foo",
            vec!["priority must be positive".into(), "internalHost is required".into()],
        );
        let message = err.to_string();
        assert!(message.contains("priority must be positive"));
        assert!(message.contains("internalHost is required"));
    }

    #[tokio::test]
    async fn test_into_response_body() {
        let response = AggregatorError::not_found("backend", "v1.foo").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["code"], 404);
        assert_eq!(value["error"]["type"], "not_found");
        assert_eq!(value["error"]["retryable"], false);
    }
}
