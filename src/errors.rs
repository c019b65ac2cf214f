use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Error body returned by every failing endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "Bad Request",
    "message": "Invalid state: Can only confirm draft orders",
    "code": "invalid_state",
    "request_id": "req-abc123xyz",
    "timestamp": "2024-12-09T10:30:00.000Z"
}))]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Bad Request")
    #[schema(example = "Not Found")]
    pub error: String,
    /// Human-readable error description
    #[schema(example = "Not found: Order 550e8400-e29b-41d4-a716-446655440000 not found")]
    pub message: String,
    /// Machine-readable error kind
    #[schema(example = "not_found")]
    pub code: String,
    /// Unique request identifier for support and debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(example = "req-abc123xyz")]
    pub request_id: Option<String>,
    /// RFC 3339 timestamp when the error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Operation not legal for the entity's current status.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Queue error: {0}")]
    QueueError(String),

    #[error("Mail error: {0}")]
    MailError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        ServiceError::DatabaseError(error.into_db_err())
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) | Self::InvalidState(_) | Self::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::InsufficientStock(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::DatabaseError(_)
            | Self::QueueError(_)
            | Self::MailError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable identifier for the error kind.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "database_error",
            Self::NotFound(_) => "not_found",
            Self::ValidationError(_) => "validation_error",
            Self::InvalidState(_) => "invalid_state",
            Self::InsufficientStock(_) => "insufficient_stock",
            Self::Conflict(_) => "conflict",
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::QueueError(_) => "queue_error",
            Self::MailError(_) => "mail_error",
            Self::SerializationError(_) => "serialization_error",
            Self::InternalError(_) | Self::Other(_) => "internal_error",
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::QueueError(_)
            | Self::MailError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.error_code(), "request failed");
        }

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            code: self.error_code().to_string(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use rstest::rstest;

    #[tokio::test]
    async fn service_error_response_includes_request_id() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("req-123"), async {
                ServiceError::NotFound("missing".into()).into_response()
            })
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.request_id.as_deref(), Some("req-123"));
        assert_eq!(payload.code, "not_found");
    }

    #[rstest]
    #[case(ServiceError::NotFound("x".into()), StatusCode::NOT_FOUND)]
    #[case(ServiceError::InvalidState("x".into()), StatusCode::BAD_REQUEST)]
    #[case(ServiceError::ValidationError("x".into()), StatusCode::BAD_REQUEST)]
    #[case(ServiceError::InsufficientStock("x".into()), StatusCode::UNPROCESSABLE_ENTITY)]
    #[case(ServiceError::Conflict("x".into()), StatusCode::CONFLICT)]
    #[case(ServiceError::Unauthorized("x".into()), StatusCode::UNAUTHORIZED)]
    #[case(ServiceError::Forbidden("x".into()), StatusCode::FORBIDDEN)]
    #[case(ServiceError::QueueError("x".into()), StatusCode::INTERNAL_SERVER_ERROR)]
    fn status_code_mapping(#[case] error: ServiceError, #[case] expected: StatusCode) {
        assert_eq!(error.status_code(), expected);
    }

    #[test]
    fn response_message_hides_internal_details() {
        assert_eq!(
            ServiceError::QueueError("sqlite busy".into()).response_message(),
            "Internal server error"
        );
        assert_eq!(
            ServiceError::db_error("connection reset").response_message(),
            "Database error"
        );
        assert_eq!(
            ServiceError::InvalidState("Can only confirm draft orders".into()).response_message(),
            "Invalid state: Can only confirm draft orders"
        );
    }
}
