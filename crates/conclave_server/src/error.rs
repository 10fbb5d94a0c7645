//! Server error types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use conclave_registry::RegistryError;
use thiserror::Error;

/// Error returned by an API handler
#[derive(Debug, Error)]
pub enum ApiError {
    /// The registry refused the operation
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Malformed request
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl ApiError {
    /// HTTP status for this error
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Registry(err) => match err {
                RegistryError::PoolNotFound(_) | RegistryError::MemberNotFound { .. } => {
                    StatusCode::NOT_FOUND
                }
                RegistryError::PoolComplete(_) | RegistryError::Resynchronize { .. } => {
                    StatusCode::CONFLICT
                }
                RegistryError::PoolClosed(_) => StatusCode::GONE,
                RegistryError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
                RegistryError::Invalid(_) => StatusCode::BAD_REQUEST,
            },
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Error loading the server configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read config file {path}: {source}")]
    Io {
        /// Path that failed
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// File is not valid configuration JSON
    #[error("invalid config file {path}: {source}")]
    Parse {
        /// Path that failed
        path: String,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },
    /// Values parsed but do not make sense
    #[error("invalid configuration: {0}")]
    Invalid(#[from] conclave_core::CoreError),
}
