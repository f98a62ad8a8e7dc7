//! Global subscriber installation

use std::io;

use tracing::Subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use super::error::{LogError, LogResult};
use crate::config::{LogFormat, LogOutput, LoggingConfig};

/// Pick the filter directives: a non-empty `RUST_LOG` wins over the config.
fn directives(config: &LoggingConfig, env_override: Option<String>) -> String {
    env_override
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| config.level.to_string())
}

/// Build the event filter for a logging config.
///
/// # Errors
///
/// Returns [`LogError::InvalidFilter`] if the directives do not parse.
pub fn build_filter(config: &LoggingConfig) -> LogResult<EnvFilter> {
    let directives = directives(config, std::env::var(EnvFilter::DEFAULT_ENV).ok());
    EnvFilter::try_new(&directives).map_err(|e| LogError::InvalidFilter {
        directives,
        message: e.to_string(),
    })
}

fn fmt_layer<S>(config: &LoggingConfig) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = tracing_subscriber::fmt::layer();
    match (config.format, config.output) {
        (LogFormat::Json, LogOutput::Stdout) => layer.json().with_writer(io::stdout).boxed(),
        (LogFormat::Json, LogOutput::Stderr) => layer.json().with_writer(io::stderr).boxed(),
        (LogFormat::Compact, LogOutput::Stdout) => {
            layer.compact().with_writer(io::stdout).boxed()
        },
        (LogFormat::Compact, LogOutput::Stderr) => {
            layer.compact().with_writer(io::stderr).boxed()
        },
        (LogFormat::Pretty, LogOutput::Stdout) => layer.pretty().with_writer(io::stdout).boxed(),
        (LogFormat::Pretty, LogOutput::Stderr) => layer.pretty().with_writer(io::stderr).boxed(),
    }
}

/// Install the global `tracing` subscriber.
///
/// # Errors
///
/// Returns an error if the filter is invalid or a subscriber is already set.
pub fn init(config: &LoggingConfig) -> LogResult<()> {
    let filter = build_filter(config)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer(config))
        .try_init()
        .map_err(|e| LogError::AlreadyInitialized(e.to_string()))
}
