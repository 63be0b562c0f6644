//! Engine error taxonomy and its HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::models::TransactionStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Invalid request: {0}")]
    InvalidRequest(anyhow::Error),

    /// Idempotency key reused with different parameters. Never retried,
    /// never merged; surfaced to the caller as-is.
    #[error("Conflicting request: {0}")]
    ConflictingRequest(String),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Payment declined: {message}")]
    Declined {
        code: Option<String>,
        message: String,
    },

    #[error("Transient provider failure: {0}")]
    Transient(String),

    #[error("Concurrent modification of transaction {0}")]
    ConcurrentModification(Uuid),

    #[error("Webhook verification failed: {0}")]
    VerificationFailed(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            details: Option<String>,
            #[serde(skip_serializing_if = "Option::is_none")]
            code: Option<String>,
        }

        let (status, error_message, details, code) = match self {
            EngineError::ValidationError(err) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "Validation error".to_string(),
                Some(err.to_string()),
                None,
            ),
            EngineError::InvalidRequest(err) => {
                (StatusCode::BAD_REQUEST, err.to_string(), None, None)
            }
            EngineError::ConflictingRequest(msg) => (StatusCode::CONFLICT, msg, None, None),
            EngineError::NotFound(err) => (StatusCode::NOT_FOUND, err.to_string(), None, None),
            EngineError::Declined { code, message } => {
                (StatusCode::PAYMENT_REQUIRED, message, None, code)
            }
            EngineError::Transient(msg) => (
                StatusCode::BAD_GATEWAY,
                format!("Provider unavailable: {msg}"),
                None,
                None,
            ),
            EngineError::ConcurrentModification(id) => (
                StatusCode::CONFLICT,
                format!("Transaction {id} was modified concurrently, retry the request"),
                None,
                None,
            ),
            EngineError::VerificationFailed(msg) => (StatusCode::UNAUTHORIZED, msg, None, None),
            EngineError::InvalidTransition { from, to } => (
                StatusCode::CONFLICT,
                format!("Transition from {from} to {to} is not allowed"),
                None,
                None,
            ),
            EngineError::Internal(err) => {
                tracing::error!(error = ?err, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    None,
                    None,
                )
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: error_message,
                details,
                code,
            }),
        )
            .into_response()
    }
}
