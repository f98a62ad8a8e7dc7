//! Module configuration hand-off.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{ModuleError, ModuleResult};

/// Key under which typed settings travel as JSON.
pub const SETTINGS_KEY: &str = "config_json";

/// Configuration handed to a module on `init` or `reload`.
///
/// A flat string map. Typed module settings are carried as JSON under
/// [`SETTINGS_KEY`].
#[derive(Debug, Clone, Default)]
pub struct ModuleConfig {
    values: HashMap<String, String>,
}

impl ModuleConfig {
    /// Creates a new empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps typed settings.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::ConfigError`] if the settings cannot be serialized.
    pub fn from_settings<T: Serialize>(settings: &T) -> ModuleResult<Self> {
        let json = serde_json::to_string(settings)
            .map_err(|e| ModuleError::ConfigError(format!("cannot encode settings: {e}")))?;
        let mut config = Self::new();
        config.set_string(SETTINGS_KEY, json);
        Ok(config)
    }

    /// Decodes the typed settings, if any were supplied.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::ConfigError`] if the stored JSON does not decode as `T`.
    pub fn settings<T: DeserializeOwned>(&self) -> ModuleResult<Option<T>> {
        self.get_string(SETTINGS_KEY)
            .map(|json| {
                serde_json::from_str(json)
                    .map_err(|e| ModuleError::ConfigError(format!("invalid settings: {e}")))
            })
            .transpose()
    }

    /// Sets a string value.
    pub fn set_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Gets a string value.
    #[must_use]
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Returns `true` if the configuration is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
