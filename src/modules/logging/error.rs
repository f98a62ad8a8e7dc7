//! Logging error types

use thiserror::Error;

/// Result type for logging operations
pub type LogResult<T> = Result<T, LogError>;

/// Logging errors
#[derive(Debug, Error)]
pub enum LogError {
    /// The filter directives could not be parsed
    #[error("invalid log filter '{directives}': {message}")]
    InvalidFilter {
        /// The offending directives
        directives: String,
        /// Parser message
        message: String,
    },

    /// A global subscriber is already installed
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(String),
}
