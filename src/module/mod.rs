//! # Module Contract
//!
//! Lifecycle, configuration hand-off, status and metrics shared by the
//! runnable parts of the relay.

mod config;
mod contract;
mod error;
mod manifest;
mod status;

pub use config::{ModuleConfig, SETTINGS_KEY};
pub use contract::{MetricsPayload, ModuleContract};
pub use error::{ModuleError, ModuleResult};
pub use manifest::{Capability, ModuleManifest, ModuleManifestBuilder, SemVer};
pub use status::ModuleStatus;
