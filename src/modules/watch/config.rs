//! Watch feed configuration.

use serde::{Deserialize, Serialize};

use super::selector::LabelSelector;

/// Source name that selects standard input.
pub const STDIN_SOURCE: &str = "-";

/// Configuration for the watch feed consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSettings {
    /// Feed source: a file path, or `-` for standard input.
    pub source: String,

    /// Only backends in this namespace are relevant (None = any namespace).
    pub namespace: Option<String>,

    /// Only backends matching this selector are relevant.
    pub label_selector: LabelSelector,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            source: STDIN_SOURCE.to_string(),
            namespace: Some("shutdownpoc".to_string()),
            label_selector: LabelSelector::new().with_label("app", "server"),
        }
    }
}

impl WatchSettings {
    /// Whether the feed is read from standard input.
    #[must_use]
    pub fn reads_stdin(&self) -> bool {
        self.source == STDIN_SOURCE
    }
}
