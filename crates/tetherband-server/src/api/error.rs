//! API error types and response handling.
//!
//! Handlers return [`ApiResult`]; engine errors convert into [`ApiError`]
//! using the status code and error code the core assigns them.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tetherband_core::TetherbandError;
use thiserror::Error;
use utoipa::ToSchema;

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Unified API error type.
///
/// Each variant maps to one HTTP status code and produces the same JSON
/// [`ErrorResponse`] body.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// 400 Bad Request - invalid input from the client.
    #[error("Bad Request: {message}")]
    BadRequest {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 404 Not Found - the beacon does not exist.
    #[error("Not Found: {message}")]
    NotFound {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 409 Conflict - the beacon is not in a state that allows the operation.
    #[error("Conflict: {message}")]
    Conflict {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 500 Internal Server Error.
    #[error("Internal Error: {message}")]
    InternalError {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 503 Service Unavailable - Bluetooth or the engine is down.
    #[error("Service Unavailable: {message}")]
    ServiceUnavailable {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// Whether retrying later may succeed.
        retryable: bool,
    },
}

/// Standard JSON error response body.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "BEACON_NOT_FOUND",
    "message": "Beacon #3 not found",
    "details": null
}))]
pub struct ErrorResponse {
    /// Machine-readable error code.
    #[schema(example = "BEACON_NOT_FOUND")]
    pub error: String,

    /// Human-readable error message.
    #[schema(example = "Beacon #3 not found")]
    pub message: String,

    /// Optional additional details.
    #[schema(nullable)]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// HTTP status for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error, message, details) = match self {
            Self::BadRequest {
                error_code,
                message,
            }
            | Self::NotFound {
                error_code,
                message,
            }
            | Self::Conflict {
                error_code,
                message,
            } => (error_code, message, None),

            Self::InternalError {
                error_code,
                message,
            } => {
                tracing::error!(error_code = %error_code, message = %message, "Internal server error");
                (error_code, message, None)
            }

            Self::ServiceUnavailable {
                error_code,
                message,
                retryable,
            } => (
                error_code,
                message,
                Some(serde_json::json!({ "retryable": retryable })),
            ),
        };

        (
            status,
            Json(ErrorResponse {
                error,
                message,
                details,
            }),
        )
            .into_response()
    }
}

/// Convert from tetherband-core errors.
impl From<TetherbandError> for ApiError {
    fn from(err: TetherbandError) -> Self {
        let error_code = err.error_code().to_string();
        let message = err.to_string();

        match err.http_status_code() {
            400 => Self::BadRequest {
                error_code,
                message,
            },
            404 => Self::NotFound {
                error_code,
                message,
            },
            409 => Self::Conflict {
                error_code,
                message,
            },
            503 => Self::ServiceUnavailable {
                error_code,
                message,
                retryable: err.is_recoverable(),
            },
            _ => Self::InternalError {
                error_code,
                message,
            },
        }
    }
}

impl From<tetherband_core::PairingError> for ApiError {
    fn from(err: tetherband_core::PairingError) -> Self {
        Self::from(TetherbandError::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tetherband_core::BeaconId;

    #[test]
    fn test_bad_request_error() {
        let err = ApiError::BadRequest {
            error_code: "test_error".to_string(),
            message: "Test message".to_string(),
        };
        assert!(err.to_string().contains("Bad Request"));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_core_errors_map_to_status() {
        let not_found = ApiError::from(TetherbandError::BeaconNotFound(BeaconId(3)));
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let conflict = ApiError::from(TetherbandError::BeaconNotConnected(BeaconId(3)));
        assert_eq!(conflict.status(), StatusCode::CONFLICT);

        let unavailable = ApiError::from(TetherbandError::EngineUnavailable);
        assert!(matches!(
            unavailable,
            ApiError::ServiceUnavailable {
                retryable: false,
                ..
            }
        ));

        let config = ApiError::from(TetherbandError::ConfigParseError("bad".to_string()));
        assert_eq!(config.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_error_response_serialization() {
        let response = ErrorResponse {
            error: "BEACON_NOT_FOUND".to_string(),
            message: "Beacon #3 not found".to_string(),
            details: None,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("BEACON_NOT_FOUND"));
    }
}
