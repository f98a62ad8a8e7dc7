//! Backend registry error types.

use thiserror::Error;

/// Errors returned when applying watch events to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The event carried no backend identity.
    #[error("{kind} event has no backend identity")]
    MissingIdentity {
        /// Event kind (added, updated, removed).
        kind: &'static str,
    },
}

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
