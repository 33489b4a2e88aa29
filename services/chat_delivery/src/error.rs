use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chat_protocol::ErrorBody;
use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

/// Errors surfaced by the stores, the fanout pipeline and the session router.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("missing or invalid credential")]
    Unauthenticated,
    #[error("not an active member of the channel")]
    Forbidden,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("conflict: {0}")]
    Conflict(&'static str),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Transient store or broadcast failure.
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

impl ChatError {
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Unauthenticated => "unauthenticated",
            ChatError::Forbidden => "forbidden",
            ChatError::NotFound(_) => "not_found",
            ChatError::Conflict(_) => "conflict",
            ChatError::InvalidInput(_) => "invalid_input",
            ChatError::DeliveryFailed(_) => "delivery_failed",
            ChatError::Database(_) | ChatError::Pool(_) => "unexpected",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ChatError::Database(_) | ChatError::Pool(_) => {
                "An unexpected error has occurred.".to_string()
            }
            other => other.to_string(),
        }
    }

    pub fn http_status_code(&self) -> StatusCode {
        match self {
            ChatError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ChatError::Forbidden => StatusCode::FORBIDDEN,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Conflict(_) => StatusCode::CONFLICT,
            ChatError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ChatError::DeliveryFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::Database(_) | ChatError::Pool(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ChatError::DeliveryFailed(_) | ChatError::Pool(_) => true,
            ChatError::Database(e) => matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().to_string(),
            message: self.message(),
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.http_status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(self.body())).into_response()
    }
}

/// True when a rusqlite error is a constraint violation (unique, primary key, foreign key).
pub fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_status() {
        assert_eq!(
            ChatError::Forbidden.http_status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ChatError::Conflict("channel_archived").http_status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(ChatError::NotFound("message").code(), "not_found");
        assert!(ChatError::DeliveryFailed("timeout".into()).is_transient());
        assert!(!ChatError::Unauthenticated.is_transient());
    }

    #[test]
    fn database_errors_hide_details() {
        let err = ChatError::Database(rusqlite::Error::QueryReturnedNoRows);
        assert_eq!(err.body().code, "unexpected");
        assert!(!err.body().message.contains("rows"));
    }
}
