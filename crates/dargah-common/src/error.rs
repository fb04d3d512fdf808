//! Error types for dargah services

use std::fmt;

/// Result type alias using DargahError
pub type Result<T> = std::result::Result<T, DargahError>;

/// Main error type shared across dargah services
#[derive(Debug, thiserror::Error)]
pub enum DargahError {
    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Authorization denied
    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    /// Invalid token
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Token expired
    #[error("Token expired")]
    TokenExpired,

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Resource already exists
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// Invalid request/argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DargahError {
    /// Create an internal error from any error type
    pub fn internal<E: fmt::Display>(err: E) -> Self {
        DargahError::Internal(err.to_string())
    }

    /// Get the error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            DargahError::AuthenticationFailed(_) => "UNAUTHENTICATED",
            DargahError::AuthorizationDenied(_) => "PERMISSION_DENIED",
            DargahError::InvalidToken(_) => "INVALID_TOKEN",
            DargahError::TokenExpired => "TOKEN_EXPIRED",
            DargahError::NotFound(_) => "NOT_FOUND",
            DargahError::AlreadyExists(_) => "ALREADY_EXISTS",
            DargahError::InvalidArgument(_) => "INVALID_ARGUMENT",
            DargahError::DatabaseError(_) => "DATABASE_ERROR",
            DargahError::ConfigError(_) => "CONFIG_ERROR",
            DargahError::SerializationError(_) => "SERIALIZATION_ERROR",
            DargahError::Internal(_) => "INTERNAL",
        }
    }
}

// Implement conversions from common error types
impl From<serde_json::Error> for DargahError {
    fn from(err: serde_json::Error) -> Self {
        DargahError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for DargahError {
    fn from(err: std::io::Error) -> Self {
        DargahError::Internal(format!("IO error: {}", err))
    }
}
