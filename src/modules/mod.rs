//! # Relay Modules
//!
//! - [`registry`] - backend pool and liveness
//! - [`watch`] - watch feed decoding and filtering
//! - [`udp_relay`] - flow binding and datagram forwarding
//! - [`logging`] - subscriber setup

pub mod logging;
pub mod registry;
pub mod udp_relay;
pub mod watch;
