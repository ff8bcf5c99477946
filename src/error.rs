//! Error types for the events ingestion pipeline

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("API error from {source_name}: {status} - {message}")]
    ApiError {
        source_name: String,
        status: u16,
        message: String,
    },

    #[error(
        "Rate limit retries exhausted for {source_name} on page {page} after {attempts} attempts"
    )]
    RateLimitExhausted {
        source_name: String,
        page: u32,
        attempts: u32,
    },

    #[error("Circuit breaker open for provider: {0}")]
    CircuitBreakerOpen(String),

    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),
}

impl IngestionError {
    /// HTTP status attached to the error, when there is one
    pub fn status_code(&self) -> Option<u16> {
        match self {
            IngestionError::ApiError { status, .. } => Some(*status),
            IngestionError::HttpError(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            IngestionError::HttpError(_) => "transport",
            IngestionError::JsonError(_) => "malformed_json",
            IngestionError::DatabaseError(_) => "database",
            IngestionError::ConfigError(_) | IngestionError::InvalidConfig(_) => "config",
            IngestionError::ApiError { .. } => "api_status",
            IngestionError::RateLimitExhausted { .. } => "rate_limit_exhausted",
            IngestionError::CircuitBreakerOpen(_) => "circuit_open",
            IngestionError::ProviderNotConfigured(_) => "not_configured",
            IngestionError::StorageError(_) => "storage",
            IngestionError::ConnectionLost(_) => "connection_lost",
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestionError>;
