//! UDP relay error types.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors that can occur in the UDP relay module.
#[derive(Debug, Error)]
pub enum UdpRelayError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {address}: {source}")]
    BindError {
        /// The address that failed to bind.
        address: SocketAddr,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to send datagram.
    #[error("failed to send datagram to {address}: {source}")]
    SendError {
        /// The destination address.
        address: SocketAddr,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to receive datagram.
    #[error("failed to receive datagram: {0}")]
    RecvError(#[source] std::io::Error),

    /// The datagram is not a `<session>|<payload>` envelope.
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope {
        /// Why the envelope was rejected.
        reason: &'static str,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    ConfigError {
        /// Error message.
        message: String,
    },

    /// No Tokio runtime to spawn relay tasks on.
    #[error("no tokio runtime available")]
    NoRuntime,
}

/// Result type alias for UDP relay operations.
pub type UdpRelayResult<T> = Result<T, UdpRelayError>;
