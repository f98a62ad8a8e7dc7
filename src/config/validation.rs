//! Configuration validation system.

use super::types::RelayConfig;
use crate::modules::udp_relay::MAX_UDP_PAYLOAD;

/// A single validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// Error message.
    pub message: String,
    /// Severity level.
    pub severity: ValidationSeverity,
}

impl ValidationError {
    /// Create a new error.
    pub fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: ValidationSeverity::Error,
        }
    }

    /// Create a new warning.
    pub fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: ValidationSeverity::Warning,
        }
    }
}

/// Severity of validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationSeverity {
    /// Error - configuration is invalid.
    Error,
    /// Warning - configuration may have issues.
    Warning,
}

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    errors: Vec<ValidationError>,
}

impl ValidationResult {
    /// Create a new empty (valid) result.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an error to the result.
    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    /// Check if the validation passed (no errors).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self
            .errors
            .iter()
            .any(|e| e.severity == ValidationSeverity::Error)
    }

    /// Get all validation issues.
    #[must_use]
    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Get only errors (not warnings).
    #[must_use]
    pub fn errors_only(&self) -> Vec<&ValidationError> {
        self.errors
            .iter()
            .filter(|e| e.severity == ValidationSeverity::Error)
            .collect()
    }

    /// Get only warnings.
    #[must_use]
    pub fn warnings(&self) -> Vec<&ValidationError> {
        self.errors
            .iter()
            .filter(|e| e.severity == ValidationSeverity::Warning)
            .collect()
    }
}

/// Trait for configuration validators.
pub trait Validator: std::fmt::Debug + Send + Sync {
    /// Validate a configuration and return any errors.
    fn validate(&self, config: &RelayConfig) -> ValidationResult;
}

/// Built-in validator for basic configuration checks.
#[derive(Debug, Default)]
pub struct BasicValidator;

impl BasicValidator {
    /// Create a new basic validator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Validator for BasicValidator {
    fn validate(&self, config: &RelayConfig) -> ValidationResult {
        let mut result = ValidationResult::new();
        let relay = &config.relay;

        if config.name.trim().is_empty() {
            result.add_error(ValidationError::error("name", "Relay name cannot be empty"));
        }

        if relay.max_datagram_size < 2 {
            result.add_error(ValidationError::error(
                "relay.max_datagram_size",
                "Maximum datagram size must fit a session id and its delimiter",
            ));
        }
        if relay.max_datagram_size > MAX_UDP_PAYLOAD {
            result.add_error(ValidationError::error(
                "relay.max_datagram_size",
                format!("Maximum datagram size cannot exceed {MAX_UDP_PAYLOAD}"),
            ));
        }

        if relay.backend_port == 0 {
            result.add_error(ValidationError::error(
                "relay.backend_port",
                "Backend port cannot be 0",
            ));
        }

        if relay.listen_port == 0 {
            result.add_error(ValidationError::warning(
                "relay.listen_port",
                "Listen port 0 binds an ephemeral port clients cannot know in advance",
            ));
        }

        if relay.idle_timeout_secs > 0 && relay.cleanup_interval_secs == 0 {
            result.add_error(ValidationError::error(
                "relay.cleanup_interval_secs",
                "Cleanup interval cannot be 0 when idle eviction is enabled",
            ));
        }

        if config.watch.source.trim().is_empty() {
            result.add_error(ValidationError::error(
                "watch.source",
                "Watch source cannot be empty (use '-' for stdin)",
            ));
        }

        if config.watch.label_selector.is_empty() {
            result.add_error(ValidationError::warning(
                "watch.label_selector",
                "Empty label selector admits every backend in the feed",
            ));
        }

        result
    }
}

/// Validator that flags a loopback listener on the backend port.
///
/// Backends on the same host would then be unreachable behind the relay
/// itself, and a backend entry of `127.0.0.1` would loop datagrams back in.
#[derive(Debug, Default)]
pub struct PortConflictValidator;

impl PortConflictValidator {
    /// Create a new port conflict validator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Validator for PortConflictValidator {
    fn validate(&self, config: &RelayConfig) -> ValidationResult {
        let mut result = ValidationResult::new();
        let relay = &config.relay;

        if relay.listen_address.is_loopback()
            && relay.listen_port != 0
            && relay.listen_port == relay.backend_port
        {
            result.add_error(ValidationError::warning(
                "relay.listen_port",
                format!(
                    "Loopback listener on port {} shadows same-host backends on relay.backend_port",
                    relay.listen_port
                ),
            ));
        }

        result
    }
}
