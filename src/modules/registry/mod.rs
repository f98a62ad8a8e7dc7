//! # Backend Registry Module
//!
//! Tracks which backends exist, which are ready and which are draining,
//! as reported by the cluster watch feed.
//!
//! ## Features
//!
//! - Concurrent map keyed by backend identity (sharded, no global lock)
//! - Idempotent `Added` / `Updated` / `Removed` application
//! - Liveness predicate: ready and not terminating
//! - Transition broadcast with an event-driven drain observer

mod backend;
mod error;
mod event;
mod observer;
mod pool;

pub use backend::{alive, BackendEntry};
pub use error::{RegistryError, RegistryResult};
pub use event::WatchEvent;
pub use observer::{DrainObserver, TransitionHandler};
pub use pool::{
    BackendRegistry, RegistryStats, RegistryTransition, DEFAULT_TRANSITION_CAPACITY,
};
