//! Watch feed error types.

use thiserror::Error;

use crate::modules::registry::RegistryError;

/// Errors raised while consuming the watch feed.
#[derive(Debug, Error)]
pub enum WatchError {
    /// Failed to open the feed source.
    #[error("failed to open watch feed '{source_name}': {source}")]
    OpenError {
        /// Feed source (path or `-`).
        source_name: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to read from the feed.
    #[error("failed to read watch feed: {0}")]
    ReadError(#[source] std::io::Error),

    /// A feed line did not decode into a watch event.
    #[error("undecodable watch event: {0}")]
    DecodeError(#[from] serde_json::Error),

    /// The event carried no backend identity.
    #[error("watch event has no backend identity")]
    MissingIdentity,

    /// Invalid label selector expression.
    #[error("invalid label selector '{selector}': {message}")]
    InvalidSelector {
        /// The offending selector.
        selector: String,
        /// Error message.
        message: String,
    },

    /// The registry rejected the event.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Result type alias for watch feed operations.
pub type WatchResult<T> = Result<T, WatchError>;
