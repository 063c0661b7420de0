//! # Error Handling
//!
//! Error types for TantoKV operations.
//!
//! ## Design Principles
//!
//! 1. **Actionable**: Every error should guide the caller toward resolution
//! 2. **Contextual**: Errors include relevant context (names, limits, paths)
//! 3. **Mappable**: Each kind maps to exactly one wire status on both surfaces

use thiserror::Error;

/// Result type alias for TantoKV operations
pub type Result<T> = std::result::Result<T, Error>;

/// Primary error type for TantoKV
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid database name: {name:?}")]
    InvalidName { name: String },

    #[error("database not found: {name}")]
    DatabaseNotFound { name: String },

    #[error("database {name} is full ({max} entries)")]
    Full { name: String, max: u64 },

    #[error("conflict: {message}")]
    Conflict { message: String },

    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },

    #[error("overloaded: admission capacity exhausted")]
    Overload,

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Check if error is recoverable from the client's point of view
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Overload => true,
            Error::Full { .. } => true,
            Error::Io { .. } => false,
            Error::Internal { .. } => false,
            _ => true,
        }
    }

    /// Get error code for monitoring
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::InvalidName { .. } => "INVALID_NAME",
            Error::DatabaseNotFound { .. } => "DB_NOT_FOUND",
            Error::Full { .. } => "DB_FULL",
            Error::Conflict { .. } => "CONFLICT",
            Error::Unauthorized { .. } => "UNAUTHORIZED",
            Error::Overload => "OVERLOAD",
            Error::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Error::Io { .. } => "IO_ERROR",
            Error::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

// Conversion from std::io::Error
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: err,
        }
    }
}
