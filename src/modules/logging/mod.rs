//! # Logging Module
//!
//! Installs the process-wide `tracing` subscriber from [`LoggingConfig`].
//!
//! - Level from configuration, overridden by `RUST_LOG` when set
//! - `pretty`, `compact` or `json` output
//! - stdout or stderr
//!
//! [`LoggingConfig`]: crate::config::LoggingConfig

pub mod error;
pub mod subscriber;

pub use error::{LogError, LogResult};
pub use subscriber::{build_filter, init};
