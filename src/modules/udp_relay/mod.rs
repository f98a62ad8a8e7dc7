//! # UDP Relay Module
//!
//! A session-affine UDP relay.
//!
//! ## Features
//!
//! - `<session-id>|<payload>` envelope parsing
//! - First-fit selection over alive backends only
//! - Sticky flow bindings that survive backend draining
//! - A dedicated upstream socket per flow, so replies reach the owning client
//!   whatever their contents
//! - Implements `ModuleContract` for lifecycle management
//!
//! ## Configuration
//!
//! ```toml
//! [relay]
//! listen_address = "0.0.0.0"
//! listen_port = 1234
//! backend_port = 1234
//! max_datagram_size = 1024
//! forward_mode = "payload"
//! ```

mod config;
mod envelope;
mod error;
mod forwarder;
mod relay;
mod selection;
mod session;
mod socket;

pub use config::{
    ForwardMode, RelaySettings, DEFAULT_BACKEND_PORT, DEFAULT_LISTEN_PORT,
    DEFAULT_MAX_DATAGRAM_SIZE, MAX_UDP_PAYLOAD,
};
pub use envelope::{Envelope, DELIMITER};
pub use error::{UdpRelayError, UdpRelayResult};
pub use forwarder::{BindingPurger, ClientOutcome, Forwarder, RelayStats, ReplyOutcome};
pub use relay::UdpRelay;
pub use selection::{select_backend, BackendSelector};
pub use session::{
    BindOutcome, Binding, BindingStats, BindingTable, FlowKey, ReverseKey, Route,
};
pub use socket::BoundSocket;
