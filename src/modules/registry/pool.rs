//! Concurrent backend registry fed by watch events.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::backend::{alive, BackendEntry};
use super::error::{RegistryError, RegistryResult};
use super::event::WatchEvent;

/// Capacity of the transition broadcast channel.
pub const DEFAULT_TRANSITION_CAPACITY: usize = 256;

/// A state change observed by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryTransition {
    /// An entry was inserted or replaced.
    Upserted {
        /// The entry that was replaced, if any.
        previous: Option<BackendEntry>,
        /// The entry now stored.
        current: BackendEntry,
    },

    /// An entry was deleted.
    Removed {
        /// The entry that was deleted.
        entry: BackendEntry,
    },
}

impl RegistryTransition {
    /// Identity of the backend this transition concerns.
    #[must_use]
    pub fn identity(&self) -> &str {
        match self {
            Self::Upserted { current, .. } => &current.identity,
            Self::Removed { entry } => &entry.identity,
        }
    }

    /// Whether the backend just entered the terminating state.
    #[must_use]
    pub fn started_draining(&self) -> bool {
        match self {
            Self::Upserted { previous, current } => {
                current.terminating && !previous.as_ref().is_some_and(|p| p.terminating)
            },
            Self::Removed { .. } => false,
        }
    }

    /// Whether liveness flipped with this transition.
    #[must_use]
    pub fn liveness_changed(&self) -> bool {
        match self {
            Self::Upserted { previous, current } => {
                previous.as_ref().is_some_and(alive) != alive(current)
            },
            Self::Removed { entry } => alive(entry),
        }
    }

    /// Whether the transition left the stored entry unchanged.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::Upserted { previous: Some(p), current } if p == current)
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Entries currently stored.
    pub backends: usize,

    /// Entries currently alive.
    pub alive: usize,

    /// Events applied successfully.
    pub events_applied: u64,

    /// Events rejected as malformed.
    pub events_rejected: u64,
}

/// Concurrent map from backend identity to its latest entry.
///
/// Mutated only through [`BackendRegistry::apply`]; each application is atomic
/// for its identity with respect to concurrent [`BackendRegistry::snapshot`] calls.
pub struct BackendRegistry {
    /// Entries keyed by identity.
    entries: DashMap<String, BackendEntry>,

    /// Transition notifications for observers.
    transitions: broadcast::Sender<RegistryTransition>,

    /// Events applied successfully.
    events_applied: AtomicU64,

    /// Events rejected as malformed.
    events_rejected: AtomicU64,
}

impl BackendRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TRANSITION_CAPACITY)
    }

    /// Create an empty registry with a custom transition channel capacity.
    #[must_use]
    pub fn with_capacity(transition_capacity: usize) -> Self {
        let (transitions, _) = broadcast::channel(transition_capacity.max(1));
        Self {
            entries: DashMap::new(),
            transitions,
            events_applied: AtomicU64::new(0),
            events_rejected: AtomicU64::new(0),
        }
    }

    /// Apply a watch event.
    ///
    /// `Added` and `Updated` replace the entry wholesale, `Removed` deletes it.
    /// Removing an unknown identity is a no-op and returns `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::MissingIdentity`] if the event has an empty
    /// identity. The registry is left untouched in that case.
    pub fn apply(&self, event: WatchEvent) -> RegistryResult<Option<RegistryTransition>> {
        let kind = event.kind();
        if event.identity().trim().is_empty() {
            self.events_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(RegistryError::MissingIdentity { kind });
        }

        let transition = match event {
            WatchEvent::Added(entry) | WatchEvent::Updated(entry) => {
                let previous = self.entries.insert(entry.identity.clone(), entry.clone());
                Some(RegistryTransition::Upserted {
                    previous,
                    current: entry,
                })
            },
            WatchEvent::Removed(entry) => self
                .entries
                .remove(&entry.identity)
                .map(|(_, entry)| RegistryTransition::Removed { entry }),
        };

        self.events_applied.fetch_add(1, Ordering::Relaxed);

        match &transition {
            Some(t) if t.liveness_changed() || t.started_draining() => {
                info!(kind, backend = t.identity(), "Backend state changed");
            },
            Some(t) => debug!(kind, backend = t.identity(), "Backend event applied"),
            None => debug!(kind, "Removal of unknown backend ignored"),
        }

        if let Some(t) = &transition {
            // Err only means nobody is subscribed.
            let _ = self.transitions.send(t.clone());
        }

        Ok(transition)
    }

    /// Current entries ordered by identity.
    #[must_use]
    pub fn snapshot(&self) -> Vec<BackendEntry> {
        let mut entries: Vec<BackendEntry> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.identity.cmp(&b.identity));
        entries
    }

    /// Look up a single backend.
    #[must_use]
    pub fn get(&self, identity: &str) -> Option<BackendEntry> {
        self.entries.get(identity).map(|e| e.value().clone())
    }

    /// Backends currently marked terminating, ordered by identity.
    #[must_use]
    pub fn draining(&self) -> Vec<BackendEntry> {
        self.snapshot()
            .into_iter()
            .filter(|e| e.terminating)
            .collect()
    }

    /// Number of backends currently alive.
    #[must_use]
    pub fn alive_count(&self) -> usize {
        self.entries.iter().filter(|e| alive(e.value())).count()
    }

    /// Number of stored backends.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Subscribe to registry transitions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryTransition> {
        self.transitions.subscribe()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            backends: self.len(),
            alive: self.alive_count(),
            events_applied: self.events_applied.load(Ordering::Relaxed),
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
        }
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.len())
            .field("alive", &self.alive_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ready(name: &str, addr: &str) -> BackendEntry {
        BackendEntry::new(name, addr).with_ready(true)
    }

    #[test]
    fn test_added_then_updated_replaces_entry() {
        let registry = BackendRegistry::new();

        registry
            .apply(WatchEvent::Added(ready("server-0", "10.0.0.1")))
            .unwrap();
        assert!(registry.get("server-0").unwrap().is_alive());

        registry
            .apply(WatchEvent::Updated(
                ready("server-0", "10.0.0.1").with_terminating(true),
            ))
            .unwrap();

        let entry = registry.get("server-0").unwrap();
        assert!(entry.terminating);
        assert!(!entry.is_alive());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_updated_for_unknown_identity_inserts() {
        let registry = BackendRegistry::new();
        registry
            .apply(WatchEvent::Updated(ready("server-3", "10.0.0.3")))
            .unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = BackendRegistry::new();
        registry
            .apply(WatchEvent::Added(ready("server-0", "10.0.0.1")))
            .unwrap();

        let first = registry
            .apply(WatchEvent::Removed(BackendEntry::new("server-0", "")))
            .unwrap();
        assert!(matches!(first, Some(RegistryTransition::Removed { .. })));

        let second = registry
            .apply(WatchEvent::Removed(BackendEntry::new("server-0", "")))
            .unwrap();
        assert!(second.is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_missing_identity_rejected() {
        let registry = BackendRegistry::new();
        let err = registry
            .apply(WatchEvent::Added(ready("  ", "10.0.0.1")))
            .unwrap_err();

        assert_eq!(err, RegistryError::MissingIdentity { kind: "added" });
        assert!(registry.is_empty());
        assert_eq!(registry.stats().events_rejected, 1);
    }

    #[test]
    fn test_snapshot_ordered_by_identity() {
        let registry = BackendRegistry::new();
        for name in ["server-c", "server-a", "server-b"] {
            registry
                .apply(WatchEvent::Added(ready(name, "10.0.0.1")))
                .unwrap();
        }

        let names: Vec<_> = registry
            .snapshot()
            .into_iter()
            .map(|e| e.identity)
            .collect();
        assert_eq!(names, vec!["server-a", "server-b", "server-c"]);
    }

    #[test]
    fn test_liveness_follows_latest_event() {
        let registry = BackendRegistry::new();
        let events = [
            WatchEvent::Added(BackendEntry::new("server-0", "10.0.0.1")),
            WatchEvent::Updated(ready("server-0", "10.0.0.1")),
            WatchEvent::Updated(ready("server-0", "10.0.0.1").with_terminating(true)),
            WatchEvent::Updated(ready("server-0", "10.0.0.1")),
        ];

        for event in events {
            let expected = event.entry().ready && !event.entry().terminating;
            registry.apply(event).unwrap();
            assert_eq!(registry.get("server-0").unwrap().is_alive(), expected);
        }
    }

    #[test]
    fn test_draining() {
        let registry = BackendRegistry::new();
        registry
            .apply(WatchEvent::Added(ready("server-0", "10.0.0.1")))
            .unwrap();
        registry
            .apply(WatchEvent::Added(
                ready("server-1", "10.0.0.2").with_terminating(true),
            ))
            .unwrap();

        let draining = registry.draining();
        assert_eq!(draining.len(), 1);
        assert_eq!(draining[0].identity, "server-1");
        assert_eq!(registry.alive_count(), 1);
    }

    #[test]
    fn test_transition_flags() {
        let registry = BackendRegistry::new();

        let added = registry
            .apply(WatchEvent::Added(ready("server-0", "10.0.0.1")))
            .unwrap()
            .unwrap();
        assert!(added.liveness_changed());
        assert!(!added.started_draining());

        let same = registry
            .apply(WatchEvent::Updated(ready("server-0", "10.0.0.1")))
            .unwrap()
            .unwrap();
        assert!(same.is_noop());
        assert!(!same.liveness_changed());

        let draining = registry
            .apply(WatchEvent::Updated(
                ready("server-0", "10.0.0.1").with_terminating(true),
            ))
            .unwrap()
            .unwrap();
        assert!(draining.started_draining());
        assert!(draining.liveness_changed());
    }

    #[tokio::test]
    async fn test_subscribers_receive_transitions() {
        let registry = BackendRegistry::new();
        let mut rx = registry.subscribe();

        registry
            .apply(WatchEvent::Added(ready("server-0", "10.0.0.1")))
            .unwrap();
        registry
            .apply(WatchEvent::Removed(BackendEntry::new("server-0", "")))
            .unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            RegistryTransition::Upserted { previous: None, .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            RegistryTransition::Removed { .. }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reads_see_whole_entries() {
        let registry = Arc::new(BackendRegistry::new());

        let writer = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for i in 0..500u32 {
                    let terminating = i % 2 == 1;
                    registry
                        .apply(WatchEvent::Updated(
                            BackendEntry::new("server-0", "10.0.0.1")
                                .with_ready(true)
                                .with_terminating(terminating),
                        ))
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        let reader = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for _ in 0..500 {
                    for entry in registry.snapshot() {
                        assert_eq!(entry.identity, "server-0");
                        assert_eq!(entry.address, "10.0.0.1");
                        assert!(entry.ready);
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        writer.await.unwrap();
        reader.await.unwrap();

        // 499 is odd, so the last event marked the backend terminating.
        assert!(!registry.get("server-0").unwrap().is_alive());
    }
}
