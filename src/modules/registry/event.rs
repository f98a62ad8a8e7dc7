//! Typed watch events consumed by the registry.

use super::backend::BackendEntry;

/// A membership or health change for one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A backend appeared.
    Added(BackendEntry),

    /// A backend's readiness or termination state changed.
    Updated(BackendEntry),

    /// A backend is gone.
    Removed(BackendEntry),
}

impl WatchEvent {
    /// Short event kind label used in logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Updated(_) => "updated",
            Self::Removed(_) => "removed",
        }
    }

    /// The backend carried by this event.
    #[must_use]
    pub fn entry(&self) -> &BackendEntry {
        match self {
            Self::Added(entry) | Self::Updated(entry) | Self::Removed(entry) => entry,
        }
    }

    /// The identity of the backend this event refers to.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.entry().identity
    }
}
