use thiserror::Error;

/// Result type alias used across the crate.
pub type Result<T> = std::result::Result<T, AppError>;

/// Errors raised by idempotency storage, the manager, and configuration.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific storage failure that has no richer error type.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A create-if-absent write found an existing record for the key.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// `complete`/`fail` called without a record created by `check`,
    /// or against a record whose result is already final.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// True for errors that originate in a storage backend.
    pub fn is_storage_error(&self) -> bool {
        matches!(
            self,
            AppError::Database(_)
                | AppError::Redis(_)
                | AppError::Serialization(_)
                | AppError::Storage(_)
                | AppError::Conflict(_)
                | AppError::NotFound(_)
        )
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::Validation(errors.to_string())
    }
}
