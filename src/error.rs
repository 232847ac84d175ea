use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sqlx::migrate::MigrateError;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Credit error: {0}")]
    Credit(#[from] CreditError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Metering errors surfaced by the spend gate, reconciler and recovery sweep
#[derive(Error, Debug)]
pub enum CreditError {
    #[error("Insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: i64, available: i64 },

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Ledger inconsistency: {0}")]
    Inconsistent(String),

    #[error("Timed out after {attempts} attempts")]
    Timeout { attempts: u32 },
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::Credit(CreditError::InsufficientCredits { required, available }) => (
                StatusCode::PAYMENT_REQUIRED,
                "INSUFFICIENT_CREDITS",
                format!("Insufficient credits: {} required, {} available", required, available),
                Some(serde_json::json!({
                    "required": required,
                    "current_balance": available,
                })),
            ),
            AppError::Credit(CreditError::ProviderUnavailable(message)) => (
                StatusCode::BAD_GATEWAY,
                "PROVIDER_UNAVAILABLE",
                format!("Upstream provider unavailable: {}", message),
                None,
            ),
            AppError::Credit(CreditError::Inconsistent(message)) => {
                error!(%message, "ledger inconsistency reported to caller");
                (
                    StatusCode::CONFLICT,
                    "LEDGER_INCONSISTENT",
                    message,
                    None,
                )
            }
            AppError::Credit(CreditError::Timeout { attempts }) => (
                StatusCode::GATEWAY_TIMEOUT,
                "PROVIDER_TIMEOUT",
                format!("Provider did not finish within {} attempts", attempts),
                Some(serde_json::json!({ "attempts": attempts })),
            ),
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Not found: {}", what),
                None,
            ),
            AppError::InvalidInput(message) | AppError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                message,
                None,
            ),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Unauthorized".to_string(),
                None,
            ),
            AppError::Database(e) => {
                error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                    None,
                )
            }
            AppError::Config(_) | AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::Credit(CreditError::ProviderUnavailable(format!(
            "HTTP request error: {}",
            error
        )))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
