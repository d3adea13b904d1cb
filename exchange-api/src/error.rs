//! Error handling for the API layer

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// API error response envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error information
    pub error: ErrorInfo,
}

/// Detailed error information
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable error code
    pub code: String,
    /// Human-readable error message
    pub message: String,
}

/// API errors
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Common(#[from] common::error::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        use common::error::Error;

        let (status, code) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Common(e) => match e {
                // Client rejections (4xx): no state change happened
                Error::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
                Error::InsufficientFunds(_) => (StatusCode::BAD_REQUEST, "insufficient_funds"),
                Error::InvalidTransition(_) => (StatusCode::CONFLICT, "invalid_transition"),
                Error::NotOwner(_) => (StatusCode::FORBIDDEN, "not_owner"),
                Error::OrderNotFound(_) => (StatusCode::NOT_FOUND, "order_not_found"),
                Error::PairNotFound(_) => (StatusCode::NOT_FOUND, "pair_not_found"),
                Error::CurrencyNotFound(_) => (StatusCode::NOT_FOUND, "currency_not_found"),
                Error::WalletNotFound(_) => (StatusCode::NOT_FOUND, "wallet_not_found"),

                // Server faults (5xx)
                Error::EngineAlreadyRunning(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "engine_already_running")
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            },
        };

        if status.is_server_error() {
            tracing::error!("API error: {:?}", self);
        } else {
            tracing::debug!("API rejection: {}", self);
        }

        let body = ErrorResponse {
            error: ErrorInfo {
                code: code.to_string(),
                message: self.to_string(),
            },
        };

        (status, Json(body)).into_response()
    }
}
