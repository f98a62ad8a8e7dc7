//! Event-driven drain observer.
//!
//! Subscribes to registry transitions and reports backends entering and
//! leaving the draining state. Extra reactions plug in through
//! [`TransitionHandler`].

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::pool::RegistryTransition;

/// Callback invoked for every registry transition the observer sees.
pub trait TransitionHandler: Send + Sync {
    /// Handle one transition.
    fn on_transition(&self, transition: &RegistryTransition);
}

impl<F> TransitionHandler for F
where
    F: Fn(&RegistryTransition) + Send + Sync,
{
    fn on_transition(&self, transition: &RegistryTransition) {
        self(transition);
    }
}

/// Watches registry transitions until shutdown or until the registry is dropped.
pub struct DrainObserver {
    transitions: broadcast::Receiver<RegistryTransition>,
    handlers: Vec<Arc<dyn TransitionHandler>>,
}

impl DrainObserver {
    /// Create an observer over a registry subscription.
    #[must_use]
    pub fn new(transitions: broadcast::Receiver<RegistryTransition>) -> Self {
        Self {
            transitions,
            handlers: Vec::new(),
        }
    }

    /// Register an additional transition handler.
    #[must_use]
    pub fn with_handler<H>(mut self, handler: H) -> Self
    where
        H: TransitionHandler + 'static,
    {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Log a transition the way operators expect to see drains.
    fn report(transition: &RegistryTransition) {
        match transition {
            t if t.started_draining() => {
                info!(
                    backend = t.identity(),
                    "Backend is terminating; existing flows stay bound"
                );
            },
            RegistryTransition::Removed { entry } if entry.terminating => {
                info!(backend = %entry.identity, "Drained backend removed");
            },
            RegistryTransition::Removed { entry } => {
                info!(backend = %entry.identity, "Backend removed without draining");
            },
            t => debug!(backend = t.identity(), "Registry transition"),
        }
    }

    /// Run until `shutdown` flips to `true` or the transition channel closes.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                received = self.transitions.recv() => match received {
                    Ok(transition) => {
                        Self::report(&transition);
                        for handler in &self.handlers {
                            handler.on_transition(&transition);
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Drain observer lagged behind registry transitions");
                    },
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Registry dropped, drain observer exiting");
                        break;
                    },
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Drain observer shutting down");
                        break;
                    }
                },
            }
        }
    }
}
