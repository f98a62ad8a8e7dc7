//! UDP relay configuration types.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Default backend port.
pub const DEFAULT_BACKEND_PORT: u16 = 1234;

/// Default client-facing port.
pub const DEFAULT_LISTEN_PORT: u16 = 1234;

/// Default maximum datagram size.
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 1024;

/// What the relay sends to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ForwardMode {
    /// Only the bytes after the session delimiter.
    #[default]
    Payload,

    /// The whole datagram, session prefix included.
    Datagram,
}

/// Configuration for the UDP relay module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Client-facing bind address.
    pub listen_address: IpAddr,

    /// Client-facing port.
    pub listen_port: u16,

    /// Bind address of the per-flow sockets used to talk to backends.
    pub upstream_address: IpAddr,

    /// Port every backend listens on.
    pub backend_port: u16,

    /// Maximum accepted datagram size; larger datagrams are dropped.
    pub max_datagram_size: usize,

    /// What gets forwarded to the backend.
    pub forward_mode: ForwardMode,

    /// Drop bindings to a backend once it leaves the registry.
    pub rebind_on_removal: bool,

    /// Evict bindings idle for this long (0 = never).
    pub idle_timeout_secs: u64,

    /// How often idle bindings are swept.
    pub cleanup_interval_secs: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: DEFAULT_LISTEN_PORT,
            upstream_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            backend_port: DEFAULT_BACKEND_PORT,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            forward_mode: ForwardMode::default(),
            rebind_on_removal: false,
            idle_timeout_secs: 0,
            cleanup_interval_secs: 30,
        }
    }
}

impl RelaySettings {
    /// Client-facing socket address.
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.listen_port)
    }

    /// Bind address for a flow's upstream socket, on an ephemeral port.
    #[must_use]
    pub fn upstream_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.upstream_address, 0)
    }

    /// Set both bind addresses.
    #[must_use]
    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.listen_address = address;
        self.upstream_address = address;
        self
    }

    /// Set the client-facing port.
    #[must_use]
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    /// Set the backend port.
    #[must_use]
    pub fn with_backend_port(mut self, port: u16) -> Self {
        self.backend_port = port;
        self
    }

    /// Set the forward mode.
    #[must_use]
    pub fn with_forward_mode(mut self, mode: ForwardMode) -> Self {
        self.forward_mode = mode;
        self
    }

    /// Idle timeout, if eviction is enabled.
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    /// Idle sweep interval.
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    /// Check the settings for values the relay cannot run with.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn check(&self) -> Result<(), String> {
        if self.max_datagram_size < 2 {
            return Err("max_datagram_size must be at least 2".to_string());
        }
        if self.max_datagram_size > MAX_UDP_PAYLOAD {
            return Err(format!("max_datagram_size must not exceed {MAX_UDP_PAYLOAD}"));
        }
        if self.backend_port == 0 {
            return Err("backend_port must not be 0".to_string());
        }
        Ok(())
    }
}
