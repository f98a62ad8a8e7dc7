//! Raw watch feed events and their decoding into typed registry events.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::error::{WatchError, WatchResult};
use crate::modules::registry::{BackendEntry, WatchEvent};

/// Event kind as delivered by the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawEventType {
    /// Backend appeared.
    #[serde(alias = "ADDED", alias = "added")]
    Added,
    /// Backend changed.
    #[serde(alias = "MODIFIED", alias = "Modified", alias = "updated")]
    Updated,
    /// Backend disappeared.
    #[serde(alias = "DELETED", alias = "Deleted", alias = "removed")]
    Removed,
}

/// Backend descriptor as delivered by the feed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawBackend {
    /// Backend identity.
    #[serde(default, alias = "identity")]
    pub name: Option<String>,

    /// Namespace the backend lives in.
    #[serde(default)]
    pub namespace: Option<String>,

    /// Backend labels.
    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// Host/IP of the backend.
    #[serde(default, alias = "podIP", alias = "pod_ip")]
    pub address: Option<String>,

    /// Readiness reported by the backend's health signal.
    #[serde(default)]
    pub ready: bool,

    /// Whether the backend is marked for removal.
    #[serde(default)]
    pub terminating: bool,

    /// Deletion timestamp; its presence also marks the backend terminating.
    #[serde(default, alias = "deletionTimestamp")]
    pub deletion_timestamp: Option<String>,
}

impl RawBackend {
    /// Whether the backend is terminating, by flag or deletion timestamp.
    #[must_use]
    pub fn is_terminating(&self) -> bool {
        self.terminating || self.deletion_timestamp.is_some()
    }
}

/// One line of the watch feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawWatchEvent {
    /// Event kind.
    #[serde(rename = "type")]
    pub event_type: RawEventType,

    /// Backend descriptor.
    #[serde(alias = "backend")]
    pub object: RawBackend,
}

impl RawWatchEvent {
    /// Decode a single JSON feed line.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::DecodeError`] if the line is not a watch event.
    pub fn decode(line: &str) -> WatchResult<Self> {
        Ok(serde_json::from_str(line)?)
    }

    /// Convert into a typed registry event.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::MissingIdentity`] if the descriptor has no name.
    pub fn into_event(self) -> WatchResult<WatchEvent> {
        let terminating = self.object.is_terminating();
        let identity = self
            .object
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or(WatchError::MissingIdentity)?;

        let entry = BackendEntry {
            identity,
            address: self.object.address.unwrap_or_default(),
            ready: self.object.ready,
            terminating,
        };

        Ok(match self.event_type {
            RawEventType::Added => WatchEvent::Added(entry),
            RawEventType::Updated => WatchEvent::Updated(entry),
            RawEventType::Removed => WatchEvent::Removed(entry),
        })
    }
}
