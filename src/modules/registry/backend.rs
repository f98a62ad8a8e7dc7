//! Backend entries and the liveness predicate.

use std::net::{IpAddr, SocketAddr};

/// A backend as last reported by the watch feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEntry {
    /// Unique backend identity (e.g. pod name).
    pub identity: String,

    /// Host/IP the backend is reachable on. May be empty while the
    /// orchestrator has not assigned an address yet.
    pub address: String,

    /// Whether the backend's own health signal reports ready.
    pub ready: bool,

    /// Whether the backend has been marked for removal.
    pub terminating: bool,
}

impl BackendEntry {
    /// Create a new backend entry that is not ready and not terminating.
    pub fn new(identity: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            address: address.into(),
            ready: false,
            terminating: false,
        }
    }

    /// Set the readiness flag.
    #[must_use]
    pub fn with_ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    /// Set the terminating flag.
    #[must_use]
    pub fn with_terminating(mut self, terminating: bool) -> Self {
        self.terminating = terminating;
        self
    }

    /// Whether this backend may receive new flows.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        alive(self)
    }

    /// Build the forwarding destination for this backend.
    ///
    /// An address that already carries a port (`10.0.0.1:9000`) keeps it;
    /// a bare IP gets `backend_port`. Returns `None` if the address is empty
    /// or not an IP literal.
    #[must_use]
    pub fn socket_addr(&self, backend_port: u16) -> Option<SocketAddr> {
        let address = self.address.trim();
        if let Ok(addr) = address.parse::<SocketAddr>() {
            return Some(addr);
        }
        address
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, backend_port))
    }
}

impl std::fmt::Display for BackendEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}) ready={} terminating={}",
            self.identity, self.address, self.ready, self.terminating
        )
    }
}

/// A backend is alive iff it is ready and not terminating.
#[must_use]
pub fn alive(entry: &BackendEntry) -> bool {
    entry.ready && !entry.terminating
}
