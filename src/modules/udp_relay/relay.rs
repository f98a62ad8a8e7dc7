//! UDP Relay - the lifecycle-managed relay module.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::module::{
    Capability, MetricsPayload, ModuleConfig, ModuleContract, ModuleError, ModuleManifest,
    ModuleResult, ModuleStatus,
};
use crate::modules::registry::{BackendRegistry, DrainObserver};

use super::config::RelaySettings;
use super::error::UdpRelayError;
use super::forwarder::{idle_eviction_task, BindingPurger, Forwarder, RelayCounters, RelayStats};
use super::selection::BackendSelector;
use super::session::BindingTable;
use super::socket::BoundSocket;

/// The UDP Relay module.
pub struct UdpRelay {
    /// Current status.
    status: ModuleStatus,

    /// Relay configuration.
    settings: Option<RelaySettings>,

    /// Backend registry shared with the watch consumer.
    registry: Arc<BackendRegistry>,

    /// Flow bindings. Cleared on stop with the sockets they use.
    bindings: Arc<BindingTable>,

    /// Forwarder of the current run.
    forwarder: Option<Arc<Forwarder>>,

    /// Statistics.
    counters: Arc<RelayCounters>,

    /// Start time.
    started_at: Option<Instant>,

    /// Shutdown signal sender.
    shutdown_tx: Option<watch::Sender<bool>>,

    /// Tasks spawned by `start`.
    tasks: Vec<JoinHandle<()>>,
}

impl UdpRelay {
    /// Create a new relay over a shared registry.
    #[must_use]
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            status: ModuleStatus::Initializing,
            settings: None,
            registry,
            bindings: Arc::new(BindingTable::new()),
            forwarder: None,
            counters: Arc::new(RelayCounters::default()),
            started_at: None,
            shutdown_tx: None,
            tasks: Vec::new(),
        }
    }

    /// Configure the relay directly from typed settings.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::ConfigError`] if the settings are unusable.
    pub fn configure(&mut self, settings: RelaySettings) -> ModuleResult<()> {
        settings.check().map_err(|message| {
            ModuleError::ConfigError(UdpRelayError::ConfigError { message }.to_string())
        })?;
        self.settings = Some(settings);
        Ok(())
    }

    /// The backend registry the relay selects from.
    #[must_use]
    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// The flow binding table.
    #[must_use]
    pub fn bindings(&self) -> &Arc<BindingTable> {
        &self.bindings
    }

    /// Client-facing address while running.
    #[must_use]
    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.forwarder.as_ref().map(|f| f.client_addr())
    }


    /// Get relay statistics.
    #[must_use]
    pub fn stats(&self) -> RelayStats {
        let c = &self.counters;
        RelayStats {
            datagrams_received: c.datagrams_received.load(Ordering::Relaxed),
            datagrams_forwarded: c.datagrams_forwarded.load(Ordering::Relaxed),
            datagrams_from_backends: c.datagrams_from_backends.load(Ordering::Relaxed),
            datagrams_to_clients: c.datagrams_to_clients.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            oversize: c.oversize.load(Ordering::Relaxed),
            no_backend: c.no_backend.load(Ordering::Relaxed),
            unexpected: c.unexpected.load(Ordering::Relaxed),
            send_errors: c.send_errors.load(Ordering::Relaxed),
            recv_errors: c.recv_errors.load(Ordering::Relaxed),
            upstream_sockets: self.forwarder.as_ref().map_or(0, |f| f.upstream_count()),
            uptime_seconds: self.uptime_seconds(),
            bindings: self.bindings.stats(),
            registry: self.registry.stats(),
        }
    }

    fn uptime_seconds(&self) -> u64 {
        self.started_at.map_or(0, |t| t.elapsed().as_secs())
    }

    fn start_failed(e: UdpRelayError) -> ModuleError {
        ModuleError::StartFailed(e.to_string())
    }
}

impl Default for UdpRelay {
    fn default() -> Self {
        Self::new(Arc::new(BackendRegistry::new()))
    }
}

impl ModuleContract for UdpRelay {
    fn manifest(&self) -> ModuleManifest {
        ModuleManifest::builder("udp-relay")
            .description("Session-affine UDP relay over a watched backend pool")
            .version(1, 0, 0)
            .capability(Capability::UdpListener)
            .capability(Capability::LoadBalancing)
            .capability(Capability::SessionAffinity)
            .capability(Capability::DrainAware)
            .capability(Capability::Metrics)
            .capability(Capability::HotReload)
            .build()
    }

    fn init(&mut self, config: ModuleConfig) -> ModuleResult<()> {
        info!("Initializing UDP Relay");
        self.status = ModuleStatus::Initializing;

        let settings = config.settings::<RelaySettings>()?.unwrap_or_default();
        self.configure(settings)?;

        info!("UDP Relay initialized");
        Ok(())
    }

    fn start(&mut self) -> ModuleResult<()> {
        info!("Starting UDP Relay");

        if !matches!(
            self.status,
            ModuleStatus::Initializing | ModuleStatus::Stopped
        ) {
            return Err(ModuleError::InvalidState {
                current: self.status.to_string(),
                expected: "Initializing or Stopped".to_string(),
            });
        }

        let settings = self
            .settings
            .clone()
            .ok_or_else(|| ModuleError::InvalidState {
                current: "No config".to_string(),
                expected: "Configuration set".to_string(),
            })?;

        let runtime =
            Handle::try_current().map_err(|_| Self::start_failed(UdpRelayError::NoRuntime))?;

        let client_socket =
            BoundSocket::bind(settings.listen_addr(), "client").map_err(Self::start_failed)?;
        // Flow sockets open on demand; an unusable upstream address fails here.
        BoundSocket::bind(settings.upstream_bind_addr(), "upstream").map_err(Self::start_failed)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let forwarder = Arc::new(Forwarder::new(
            client_socket,
            BackendSelector::new(Arc::clone(&self.registry), settings.backend_port),
            Arc::clone(&self.bindings),
            &settings,
            Arc::clone(&self.counters),
            shutdown_rx.clone(),
        ));

        let mut tasks = Vec::new();
        tasks.push(runtime.spawn(Arc::clone(&forwarder).run_client_loop()));

        let mut observer = DrainObserver::new(self.registry.subscribe());
        if settings.rebind_on_removal {
            observer = observer.with_handler(BindingPurger::new(
                Arc::clone(&forwarder),
                settings.backend_port,
            ));
        }
        tasks.push(runtime.spawn(observer.run(shutdown_rx.clone())));

        if let Some(timeout) = settings.idle_timeout() {
            tasks.push(runtime.spawn(idle_eviction_task(
                Arc::clone(&forwarder),
                timeout,
                settings.cleanup_interval(),
                shutdown_rx,
            )));
        }

        info!(
            client = %forwarder.client_addr(),
            upstream = %settings.upstream_address,
            backend_port = settings.backend_port,
            forward_mode = ?settings.forward_mode,
            "UDP Relay started"
        );

        self.forwarder = Some(forwarder);
        self.shutdown_tx = Some(shutdown_tx);
        self.tasks = tasks;
        self.started_at = Some(Instant::now());
        self.status = ModuleStatus::Running;
        Ok(())
    }

    fn stop(&mut self) -> ModuleResult<()> {
        info!("Stopping UDP Relay");

        if !matches!(self.status, ModuleStatus::Running) {
            return Err(ModuleError::InvalidState {
                current: self.status.to_string(),
                expected: "Running".to_string(),
            });
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        // Abort as well so the sockets are released without waiting for a poll.
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(forwarder) = self.forwarder.take() {
            let released = forwarder.release_all();
            info!(released, "Released flow bindings");
        }

        self.status = ModuleStatus::Stopped;
        info!("UDP Relay stopped");
        Ok(())
    }

    fn reload(&mut self, config: ModuleConfig) -> ModuleResult<()> {
        info!("Reloading UDP Relay configuration");

        let new_settings = config.settings::<RelaySettings>()?.ok_or_else(|| {
            ModuleError::ConfigError("no relay settings provided for reload".to_string())
        })?;

        // Sockets stay bound; new settings apply on the next start.
        self.configure(new_settings)?;

        info!("UDP Relay configuration reloaded");
        Ok(())
    }

    fn status(&self) -> ModuleStatus {
        if self.status == ModuleStatus::Running && self.registry.stats().alive == 0 {
            return ModuleStatus::Degraded {
                reason: "no live backends".to_string(),
            };
        }
        self.status.clone()
    }

    fn metrics(&self) -> MetricsPayload {
        let stats = self.stats();
        let mut metrics = MetricsPayload::new();

        metrics.counter("datagrams_received", stats.datagrams_received);
        metrics.counter("datagrams_forwarded", stats.datagrams_forwarded);
        metrics.counter("datagrams_from_backends", stats.datagrams_from_backends);
        metrics.counter("datagrams_to_clients", stats.datagrams_to_clients);
        metrics.counter("bytes_received", stats.bytes_received);
        metrics.counter("bytes_sent", stats.bytes_sent);
        metrics.counter("datagrams_malformed", stats.malformed);
        metrics.counter("datagrams_oversize", stats.oversize);
        metrics.counter("datagrams_no_backend", stats.no_backend);
        metrics.counter("datagrams_unexpected", stats.unexpected);
        metrics.counter("send_errors", stats.send_errors);
        metrics.counter("recv_errors", stats.recv_errors);
        metrics.counter("bindings_created", stats.bindings.total_created);
        metrics.counter("bindings_evicted", stats.bindings.evicted);
        metrics.counter("registry_events_applied", stats.registry.events_applied);
        metrics.counter("registry_events_rejected", stats.registry.events_rejected);
        metrics.gauge("bindings_active", stats.bindings.active_bindings as f64);
        metrics.gauge("upstream_sockets", stats.upstream_sockets as f64);
        metrics.gauge("backends", stats.registry.backends as f64);
        metrics.gauge("backends_alive", stats.registry.alive as f64);
        metrics.gauge("uptime_seconds", stats.uptime_seconds as f64);

        metrics
    }
}

impl std::fmt::Debug for UdpRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpRelay")
            .field("status", &self.status)
            .field("settings", &self.settings)
            .field("forwarder", &self.forwarder)
            .finish()
    }
}
