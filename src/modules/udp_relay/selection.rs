//! First-fit backend selection.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::modules::registry::{alive, BackendEntry, BackendRegistry};

/// Pick the first alive backend in snapshot order.
///
/// Alive entries whose address does not form a socket address are skipped
/// and the scan continues.
#[must_use]
pub fn select_backend(
    snapshot: &[BackendEntry],
    backend_port: u16,
) -> Option<(&BackendEntry, SocketAddr)> {
    snapshot.iter().filter(|e| alive(e)).find_map(|entry| {
        match entry.socket_addr(backend_port) {
            Some(addr) => Some((entry, addr)),
            None => {
                warn!(
                    backend = %entry.identity,
                    address = %entry.address,
                    "Skipping alive backend with unusable address"
                );
                None
            },
        }
    })
}

/// Selects backends against the live registry.
#[derive(Debug, Clone)]
pub struct BackendSelector {
    registry: Arc<BackendRegistry>,
    backend_port: u16,
}

impl BackendSelector {
    /// Create a selector over a registry.
    #[must_use]
    pub fn new(registry: Arc<BackendRegistry>, backend_port: u16) -> Self {
        Self {
            registry,
            backend_port,
        }
    }

    /// Select a backend for a new flow from a fresh snapshot.
    #[must_use]
    pub fn select(&self) -> Option<SocketAddr> {
        let snapshot = self.registry.snapshot();
        let (entry, addr) = select_backend(&snapshot, self.backend_port)?;
        debug!(backend = %entry.identity, address = %addr, "Selected backend");
        Some(addr)
    }

    /// The registry this selector reads.
    #[must_use]
    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// The port backends listen on.
    #[must_use]
    pub fn backend_port(&self) -> u16 {
        self.backend_port
    }
}
