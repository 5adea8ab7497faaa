//! Error types and JSON error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;

/// Failure to bring up a backend process
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to allocate a free port: {0}")]
    PortAllocation(#[source] std::io::Error),

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by the instance registry
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("failed to launch backend for {}: {source}", directory.display())]
    Launch {
        directory: PathBuf,
        #[source]
        source: LaunchError,
    },

    /// The spawned launch task panicked or was cancelled
    #[error("launch task for {} did not complete", directory.display())]
    LaunchAborted { directory: PathBuf },

    #[error("gateway is shutting down")]
    Closed,
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub message: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"message":"{}"}}"#,
                self.message.replace('\\', "\\\\").replace('\"', "\\\"")
            )
        })
    }
}

/// Create a JSON error response
pub fn json_error_response(
    status: StatusCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorResponse::new(message).to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

impl InstanceError {
    /// HTTP status for this error at the API boundary
    pub fn status_code(&self) -> StatusCode {
        match self {
            InstanceError::NotFound(_) => StatusCode::NOT_FOUND,
            InstanceError::Launch { .. } | InstanceError::LaunchAborted { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            InstanceError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        json_error_response(self.status_code(), self.to_string())
    }
}
