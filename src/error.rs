use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;

/// Postgres SQLSTATE codes raised when `lock_timeout` / `statement_timeout` fire.
const SQLSTATE_LOCK_NOT_AVAILABLE: &str = "55P03";
const SQLSTATE_QUERY_CANCELED: &str = "57014";

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: i64, available: i64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Invalid state: {current}, expected: {expected}")]
    InvalidState { current: String, expected: String },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Timed out waiting for a ledger lock")]
    Timeout,

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Job queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue broker unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to serialize job descriptor: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for QueueError {
    fn from(error: redis::RedisError) -> Self {
        QueueError::Unavailable(error.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        let timed_out = error
            .as_database_error()
            .and_then(|db| db.code())
            .map(|code| code == SQLSTATE_LOCK_NOT_AVAILABLE || code == SQLSTATE_QUERY_CANCELED)
            .unwrap_or(false);

        if timed_out {
            AppError::Timeout
        } else {
            AppError::Database(error)
        }
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

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let message = errors
            .field_errors()
            .into_iter()
            .map(|(field, errors)| {
                let messages: Vec<String> = errors
                    .iter()
                    .map(|e| {
                        e.message
                            .as_ref()
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| e.code.to_string())
                    })
                    .collect();
                format!("{}: {}", field, messages.join(", "))
            })
            .collect::<Vec<String>>()
            .join("; ");

        AppError::Validation(message)
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    pub error_code: String,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::InvalidAction(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidState { .. } => StatusCode::CONFLICT,
            AppError::Timeout => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Database(_)
            | AppError::Queue(_)
            | AppError::Storage(_)
            | AppError::Config(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::InvalidAction(_) => "INVALID_ACTION",
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::InvalidState { .. } => "INVALID_STATE",
            AppError::Timeout => "LOCK_TIMEOUT",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Infrastructure failures never leak their details to the client.
    fn public_message(&self) -> String {
        match self {
            AppError::InsufficientBalance { required, available } => format!(
                "Insufficient tokens. Cost: {}, Balance: {}",
                required, available
            ),
            AppError::Timeout => "The ledger is busy, please retry".to_string(),
            AppError::Database(_)
            | AppError::Queue(_)
            | AppError::Storage(_)
            | AppError::Config(_)
            | AppError::Internal(_) => "An internal error occurred".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = Json(ErrorResponse {
            success: false,
            message: self.public_message(),
            error_code: self.error_code().to_string(),
        });

        (status, body).into_response()
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
