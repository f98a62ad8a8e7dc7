//! The lifecycle contract implemented by runnable modules.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use super::{ModuleConfig, ModuleError, ModuleManifest, ModuleResult, ModuleStatus};

/// Point-in-time metrics reported by a module.
#[derive(Debug, Clone, Default)]
pub struct MetricsPayload {
    /// Monotonically increasing counters.
    pub counters: BTreeMap<String, u64>,

    /// Values that can go up and down.
    pub gauges: BTreeMap<String, f64>,
}

impl MetricsPayload {
    /// Creates a new empty metrics payload.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a counter metric.
    pub fn counter(&mut self, name: impl Into<String>, value: u64) {
        self.counters.insert(name.into(), value);
    }

    /// Adds a gauge metric.
    pub fn gauge(&mut self, name: impl Into<String>, value: f64) {
        self.gauges.insert(name.into(), value);
    }

    /// Formats metrics in Prometheus text exposition format, sorted by name.
    #[must_use]
    pub fn to_prometheus(&self, prefix: &str) -> String {
        let mut output = String::new();

        for (name, value) in &self.counters {
            let _ = writeln!(output, "{prefix}_{name} {value}");
        }
        for (name, value) in &self.gauges {
            let _ = writeln!(output, "{prefix}_{name} {value}");
        }

        output
    }
}

/// Lifecycle contract for a runnable module.
///
/// # Lifecycle
///
/// 1. `manifest()` - identity and capabilities
/// 2. `init()` - accept configuration
/// 3. `start()` - bind resources and begin processing
/// 4. `status()` / `metrics()` / `heartbeat()` - monitoring
/// 5. `reload()` - accept new configuration
/// 6. `stop()` - release resources
pub trait ModuleContract: Send + Sync {
    /// Returns the module's manifest.
    fn manifest(&self) -> ModuleManifest;

    /// Initializes the module with the provided configuration.
    ///
    /// # Errors
    ///
    /// Returns `ModuleError::ConfigError` if the configuration is invalid.
    fn init(&mut self, config: ModuleConfig) -> ModuleResult<()>;

    /// Starts processing.
    ///
    /// # Errors
    ///
    /// Returns `ModuleError::StartFailed` if the module cannot start.
    /// Returns `ModuleError::InvalidState` if the module is already running.
    fn start(&mut self) -> ModuleResult<()>;

    /// Stops processing and releases resources.
    ///
    /// # Errors
    ///
    /// Returns `ModuleError::InvalidState` if the module is not running.
    fn stop(&mut self) -> ModuleResult<()>;

    /// Accepts new configuration.
    ///
    /// # Errors
    ///
    /// Returns `ModuleError::ConfigError` if the new configuration is invalid
    /// or reload is not supported.
    fn reload(&mut self, _config: ModuleConfig) -> ModuleResult<()> {
        Err(ModuleError::ConfigError("reload not supported".to_string()))
    }

    /// Returns the current status of the module.
    fn status(&self) -> ModuleStatus;

    /// Returns the current metrics from the module.
    fn metrics(&self) -> MetricsPayload;

    /// Liveness check. Defaults to [`ModuleStatus::is_operational`].
    fn heartbeat(&self) -> bool {
        self.status().is_operational()
    }
}
