use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::services::ledger::LedgerError;
use crate::services::promo::PromoError;
use crate::services::providers::ProviderError;

/// Top-level error taxonomy. Validation and not-found problems are always
/// surfaced as 4xx with a human-readable reason; provider failures are
/// surfaced for the caller to retry with a fresh request; database errors
/// are sanitized before leaving the process.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("insufficient funds: available {available}, required {required}")]
    InsufficientFunds { available: i64, required: i64 },
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("payment provider error: {0}")]
    Provider(String),
    #[error("database error")]
    Database(#[from] sqlx::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Provider(_) => StatusCode::BAD_GATEWAY,
            ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-safe message. Internal errors never leak SQL details.
    fn client_message(&self) -> String {
        match self {
            ApiError::Database(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Database(ref e) = self {
            tracing::error!("database error: {e}");
        }
        (self.status(), Json(json!({ "error": self.client_message() }))).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds { available, required } => {
                ApiError::InsufficientFunds { available, required }
            }
            LedgerError::AccountNotFound(id) => ApiError::NotFound(format!("account {id} not found")),
            LedgerError::InvalidAmount(v) => ApiError::Validation(format!("invalid amount: {v}")),
            LedgerError::DuplicateReference(r) => {
                ApiError::Conflict(format!("duplicate external reference: {r}"))
            }
            LedgerError::NotPending(id) => {
                ApiError::Conflict(format!("transaction {id} is not pending"))
            }
            LedgerError::Database(e) => ApiError::Database(e),
        }
    }
}

impl From<PromoError> for ApiError {
    fn from(err: PromoError) -> Self {
        match err {
            PromoError::NotFound => ApiError::NotFound("promo code not found".to_string()),
            PromoError::UsageLimitReached | PromoError::PerUserLimitReached => {
                ApiError::Conflict(err.to_string())
            }
            PromoError::Database(e) => ApiError::Database(e),
            other => ApiError::Validation(other.to_string()),
        }
    }
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        ApiError::Provider(err.to_string())
    }
}
