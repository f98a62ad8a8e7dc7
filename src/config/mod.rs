//! # Configuration System
//!
//! This module provides TOML-based configuration management for R0N Relay.
//! It includes parsing and pluggable validation.
//!
//! ## Example Configuration
//!
//! ```toml
//! name = "edge-relay"
//!
//! [relay]
//! listen_address = "0.0.0.0"
//! listen_port = 1234
//! backend_port = 1234
//! max_datagram_size = 1024
//! forward_mode = "payload"
//!
//! [watch]
//! source = "-"
//! namespace = "shutdownpoc"
//! label_selector = "app=server"
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```

mod error;
mod loader;
mod types;
mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use types::{LogFormat, LogLevel, LogOutput, LoggingConfig, RelayConfig};
pub use validation::{
    BasicValidator, PortConflictValidator, ValidationError, ValidationResult,
    ValidationSeverity, Validator,
};
