//! Error-to-HTTP mapping
//!
//! Every surfaced failure carries the error kind, its stable numeric code,
//! a correlation id and, for retryable kinds, a suggested retry-after.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use mahavishnu_core::{Error, ErrorKind};

/// JSON body for surfaced errors
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Tagged error kind, e.g. `exhausted`
    pub error: String,
    /// Stable numeric code
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Wrapper turning orchestrator errors into responses
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Invalid => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Exhausted => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        // Client went away; nginx convention
        ErrorKind::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        ErrorKind::DependencyDown => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = status_for(err.kind);

        // Internal details stay in the logs, not the response
        let message = if err.kind == ErrorKind::Internal {
            tracing::error!(error = %err, "internal error surfaced");
            "internal error".to_string()
        } else {
            err.message.clone()
        };

        let body = ErrorBody {
            error: err.kind.to_string(),
            code: err.code(),
            message,
            correlation_id: err.correlation_id.map(|id| id.to_string()),
            retry_after_ms: err.retry_after.map(|d| d.as_millis() as u64),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::Exhausted), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for(ErrorKind::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(ErrorKind::Cancelled).as_u16(), 499);
        assert_eq!(
            status_for(ErrorKind::DependencyDown),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
