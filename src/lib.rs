//! # R0N Relay
//!
//! A session-affine UDP relay. Clients send `<session>|<payload>` datagrams;
//! each (client, session) flow is pinned to the first live backend seen when
//! the flow begins and stays there while the pool changes underneath it.
//!
//! ## Architecture
//!
//! - [`modules::watch`] turns a newline-delimited watch feed into registry events
//! - [`modules::registry`] tracks backend membership and liveness
//! - [`modules::udp_relay`] binds flows and forwards datagrams both ways
//! - [`modules::logging`] installs the `tracing` subscriber
//!
//! The relay implements [`module::ModuleContract`] for lifecycle management and
//! is configured through [`config`].

pub mod config;
pub mod module;
pub mod modules;
