//! Error types for the wallet sweeper

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Main error type for the sweeper
#[derive(Error, Debug)]
pub enum SweeperError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Bad client input. The message is returned to the caller verbatim.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Upstream error from {endpoint}: {message}")]
    Upstream { endpoint: String, message: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SweeperError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SweeperError::Upstream { .. } | SweeperError::Timeout { .. }
        )
    }

    /// HTTP status this error maps to
    pub fn status_code(&self) -> StatusCode {
        match self {
            SweeperError::Validation(_) => StatusCode::BAD_REQUEST,
            SweeperError::Conflict(_) => StatusCode::CONFLICT,
            SweeperError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn upstream(endpoint: impl Into<String>, message: impl ToString) -> Self {
        SweeperError::Upstream {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }
}

impl IntoResponse for SweeperError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            SweeperError::Validation(m) | SweeperError::Conflict(m) | SweeperError::NotFound(m) => {
                m.clone()
            }
            other => {
                // Full detail stays server side
                error!("Request failed: {}", other);
                "Request failed. Please try again.".to_string()
            }
        };

        (status, Json(json!({ "type": "error", "error": message }))).into_response()
    }
}

/// Result type for sweeper operations
pub type SweeperResult<T> = Result<T, SweeperError>;

/// Failure reported by a transfer executor
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransferFailure {
    #[error("Transaction reverted: {0}")]
    Reverted(String),

    #[error("Insufficient funds or gas: {0}")]
    InsufficientFunds(String),

    #[error("Submission failed: {0}")]
    Submission(String),

    #[error("Submission timed out after {0}ms")]
    Timeout(u64),

    #[error("Signer error: {0}")]
    Signer(String),
}

impl TransferFailure {
    /// Classify a raw RPC error message
    pub fn from_rpc_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("insufficient funds") || lower.contains("gas required exceeds") {
            TransferFailure::InsufficientFunds(message)
        } else if lower.contains("revert") {
            TransferFailure::Reverted(message)
        } else {
            TransferFailure::Submission(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            SweeperError::Validation("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            SweeperError::Conflict("dup".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            SweeperError::NotFound("none".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            SweeperError::upstream("https://rpc", "boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_upstream_detail_not_leaked() {
        let response = SweeperError::upstream("https://rpc.internal", "secret rpc text").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(!text.contains("secret rpc text"));
        assert!(!text.contains("rpc.internal"));
    }

    #[test]
    fn test_transfer_failure_classification() {
        assert!(matches!(
            TransferFailure::from_rpc_message("insufficient funds for gas * price + value"),
            TransferFailure::InsufficientFunds(_)
        ));
        assert!(matches!(
            TransferFailure::from_rpc_message("execution reverted: below minimum"),
            TransferFailure::Reverted(_)
        ));
        assert!(matches!(
            TransferFailure::from_rpc_message("connection reset"),
            TransferFailure::Submission(_)
        ));
    }

    #[test]
    fn test_retryable() {
        assert!(SweeperError::Timeout { operation: "poll".into() }.is_retryable());
        assert!(!SweeperError::Validation("x".into()).is_retryable());
    }
}
