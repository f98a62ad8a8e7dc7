//! Watch feed consumer: decodes, filters and applies events to the registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::config::WatchSettings;
use super::error::{WatchError, WatchResult};
use super::event::{RawBackend, RawWatchEvent};
use super::selector::LabelSelector;
use crate::modules::registry::{BackendRegistry, RegistryTransition, WatchEvent};

/// Decides which backends from the feed belong to the pool.
#[derive(Debug, Clone, Default)]
pub struct WatchFilter {
    namespace: Option<String>,
    selector: LabelSelector,
}

impl WatchFilter {
    /// Create a filter.
    #[must_use]
    pub fn new(namespace: Option<String>, selector: LabelSelector) -> Self {
        Self {
            namespace,
            selector,
        }
    }

    /// Build a filter from watch settings.
    #[must_use]
    pub fn from_settings(settings: &WatchSettings) -> Self {
        Self::new(settings.namespace.clone(), settings.label_selector.clone())
    }

    /// Whether a backend is in scope.
    #[must_use]
    pub fn matches(&self, backend: &RawBackend) -> bool {
        self.mismatch(backend).is_none()
    }

    /// Why a backend is out of scope, or `None` if it is in scope.
    ///
    /// Descriptors that carry no namespace are assumed to be pre-filtered by
    /// the feed and pass the namespace check. Descriptors without labels only
    /// pass an empty selector.
    #[must_use]
    pub fn mismatch(&self, backend: &RawBackend) -> Option<&'static str> {
        if let (Some(wanted), Some(actual)) = (&self.namespace, &backend.namespace) {
            if wanted != actual {
                return Some("namespace");
            }
        }
        if !self.selector.matches(&backend.labels) {
            return Some("label selector");
        }
        None
    }
}

/// Watch consumer statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchStats {
    /// Events applied to the registry.
    pub applied: u64,

    /// Events dropped as malformed.
    pub rejected: u64,

    /// Events for backends outside the filter.
    pub out_of_scope: u64,
}

/// Applies the watch feed to a backend registry.
pub struct WatchConsumer {
    registry: Arc<BackendRegistry>,
    filter: WatchFilter,
    applied: AtomicU64,
    rejected: AtomicU64,
    out_of_scope: AtomicU64,
}

impl WatchConsumer {
    /// Create a consumer for the given registry.
    #[must_use]
    pub fn new(registry: Arc<BackendRegistry>, filter: WatchFilter) -> Self {
        Self {
            registry,
            filter,
            applied: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            out_of_scope: AtomicU64::new(0),
        }
    }

    /// Apply one raw event.
    ///
    /// Added or updated backends that fall outside the filter are applied as
    /// removals, so a backend whose labels stop matching leaves the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the event has no identity. The registry is not
    /// modified in that case.
    pub fn handle(&self, raw: RawWatchEvent) -> WatchResult<Option<RegistryTransition>> {
        let mismatch = self.filter.mismatch(&raw.object);
        let labelled = !raw.object.labels.is_empty();
        let event = match raw.into_event() {
            Ok(event) => event,
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            },
        };

        let event = match mismatch {
            None => event,
            Some(reason) => {
                self.out_of_scope.fetch_add(1, Ordering::Relaxed);
                match event {
                    WatchEvent::Added(entry) | WatchEvent::Updated(entry) => {
                        info!(
                            backend = %entry.identity,
                            reason,
                            labelled,
                            "Backend outside watch filter, treating as removed"
                        );
                        WatchEvent::Removed(entry)
                    },
                    removed => removed,
                }
            },
        };

        let entry = event.entry();
        info!(
            kind = event.kind(),
            backend = %entry.identity,
            address = %entry.address,
            ready = entry.ready,
            terminating = entry.terminating,
            "Watch event"
        );

        let transition = self.registry.apply(event).inspect_err(|_| {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        })?;
        self.applied.fetch_add(1, Ordering::Relaxed);
        Ok(transition)
    }

    /// Decode and apply one feed line. Blank lines are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the line does not decode into a watch event.
    pub fn handle_line(&self, line: &str) -> WatchResult<Option<RegistryTransition>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        match RawWatchEvent::decode(line) {
            Ok(raw) => self.handle(raw),
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(e)
            },
        }
    }

    /// Consume a newline-delimited JSON feed until end of stream or shutdown.
    ///
    /// Malformed lines are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::ReadError`] if reading the feed fails.
    pub async fn run<R>(&self, reader: R, mut shutdown: watch::Receiver<bool>) -> WatchResult<WatchStats>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Err(e) = self.handle_line(&line) {
                            warn!(error = %e, "Dropping malformed watch event");
                        }
                    },
                    Ok(None) => {
                        info!("Watch feed closed");
                        break;
                    },
                    Err(e) => return Err(WatchError::ReadError(e)),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Watch consumer shutting down");
                        break;
                    }
                },
            }
        }

        Ok(self.stats())
    }

    /// Get consumer statistics.
    #[must_use]
    pub fn stats(&self) -> WatchStats {
        WatchStats {
            applied: self.applied.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            out_of_scope: self.out_of_scope.load(Ordering::Relaxed),
        }
    }
}

/// A boxed line-oriented feed reader.
pub type FeedReader = Box<dyn AsyncBufRead + Unpin + Send>;

/// Open the configured feed source.
///
/// # Errors
///
/// Returns [`WatchError::OpenError`] if the source file cannot be opened.
pub async fn open_feed(settings: &WatchSettings) -> WatchResult<FeedReader> {
    if settings.reads_stdin() {
        info!("Reading watch feed from stdin");
        return Ok(Box::new(BufReader::new(tokio::io::stdin())));
    }

    let file = tokio::fs::File::open(&settings.source)
        .await
        .map_err(|e| WatchError::OpenError {
            source_name: settings.source.clone(),
            source: e,
        })?;

    info!(source = %settings.source, "Reading watch feed from file");
    Ok(Box::new(BufReader::new(file)))
}
