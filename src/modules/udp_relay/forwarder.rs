//! Packet forwarding between clients and backends.
//!
//! Client datagrams arrive on the client-facing socket, get bound to a backend
//! on first sight and are sent out of an upstream socket opened for that flow.
//! Each upstream socket has a reader that sends backend replies back to the
//! flow's client from the client-facing socket, so clients only ever see one
//! relay address.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::config::{ForwardMode, RelaySettings};
use super::envelope::Envelope;
use super::error::UdpRelayResult;
use super::selection::BackendSelector;
use super::session::{BindOutcome, BindingStats, BindingTable, FlowKey, Route};
use super::socket::BoundSocket;
use crate::modules::registry::{RegistryStats, RegistryTransition, TransitionHandler};

/// What happened to a client datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientOutcome {
    /// Sent to the bound backend.
    Forwarded {
        /// Destination backend.
        backend: SocketAddr,
        /// Bytes sent.
        bytes: usize,
        /// Whether this datagram created the binding.
        new_binding: bool,
    },

    /// Not a valid envelope.
    Malformed,

    /// Larger than the configured maximum.
    Oversize,

    /// Unbound flow and no alive backend.
    NoBackend,

    /// A backend was selected but no upstream socket could be opened.
    UpstreamFailed {
        /// Selected backend.
        backend: SocketAddr,
    },

    /// The send to the backend failed.
    SendFailed {
        /// Destination backend.
        backend: SocketAddr,
    },
}

/// What happened to a backend datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Sent to the owning client.
    Returned {
        /// Destination client.
        client: SocketAddr,
        /// Bytes sent.
        bytes: usize,
    },

    /// Larger than the configured maximum.
    Oversize,

    /// The sender is not the backend bound to this upstream socket.
    Unexpected,

    /// The send to the client failed.
    SendFailed {
        /// Destination client.
        client: SocketAddr,
    },
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    /// Datagrams received from clients.
    pub datagrams_received: u64,

    /// Datagrams forwarded to backends.
    pub datagrams_forwarded: u64,

    /// Datagrams received from backends.
    pub datagrams_from_backends: u64,

    /// Datagrams returned to clients.
    pub datagrams_to_clients: u64,

    /// Bytes received on all sockets.
    pub bytes_received: u64,

    /// Bytes sent on all sockets.
    pub bytes_sent: u64,

    /// Datagrams dropped as malformed.
    pub malformed: u64,

    /// Datagrams dropped as oversize.
    pub oversize: u64,

    /// Datagrams dropped because no backend was alive.
    pub no_backend: u64,

    /// Backend datagrams with no matching binding.
    pub unexpected: u64,

    /// Failed sends and upstream socket opens.
    pub send_errors: u64,

    /// Failed receives on any socket.
    pub recv_errors: u64,

    /// Open per-flow upstream sockets.
    pub upstream_sockets: usize,

    /// Uptime in seconds.
    pub uptime_seconds: u64,

    /// Binding table statistics.
    pub bindings: BindingStats,

    /// Registry statistics.
    pub registry: RegistryStats,
}

/// Inner statistics (atomic counters), shared by all loops.
#[derive(Default)]
pub(crate) struct RelayCounters {
    pub(crate) datagrams_received: AtomicU64,
    pub(crate) datagrams_forwarded: AtomicU64,
    pub(crate) datagrams_from_backends: AtomicU64,
    pub(crate) datagrams_to_clients: AtomicU64,
    pub(crate) bytes_received: AtomicU64,
    pub(crate) bytes_sent: AtomicU64,
    pub(crate) malformed: AtomicU64,
    pub(crate) oversize: AtomicU64,
    pub(crate) no_backend: AtomicU64,
    pub(crate) unexpected: AtomicU64,
    pub(crate) send_errors: AtomicU64,
    pub(crate) recv_errors: AtomicU64,
}

impl RelayCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn add(counter: &AtomicU64, value: usize) {
        counter.fetch_add(value as u64, Ordering::Relaxed);
    }
}

/// A flow's upstream socket and the task reading replies from it.
struct FlowUpstream {
    socket: Arc<BoundSocket>,
    reader: AbortHandle,
}

/// Moves datagrams between clients and backends.
pub struct Forwarder {
    client_socket: BoundSocket,
    upstream_bind: SocketAddr,
    upstreams: DashMap<SocketAddr, FlowUpstream>,
    selector: BackendSelector,
    bindings: Arc<BindingTable>,
    forward_mode: ForwardMode,
    max_datagram_size: usize,
    counters: Arc<RelayCounters>,
    shutdown: watch::Receiver<bool>,
}

impl Forwarder {
    /// Create a forwarder over a bound client-facing socket.
    pub(crate) fn new(
        client_socket: BoundSocket,
        selector: BackendSelector,
        bindings: Arc<BindingTable>,
        settings: &RelaySettings,
        counters: Arc<RelayCounters>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            client_socket,
            upstream_bind: settings.upstream_bind_addr(),
            upstreams: DashMap::new(),
            selector,
            bindings,
            forward_mode: settings.forward_mode,
            max_datagram_size: settings.max_datagram_size,
            counters,
            shutdown,
        }
    }

    /// Address clients send to.
    #[must_use]
    pub fn client_addr(&self) -> SocketAddr {
        self.client_socket.bound_addr()
    }

    /// Number of open upstream sockets.
    #[must_use]
    pub fn upstream_count(&self) -> usize {
        self.upstreams.len()
    }

    /// Route one datagram received from a client.
    pub async fn handle_client_datagram(
        self: &Arc<Self>,
        datagram: &[u8],
        peer: SocketAddr,
    ) -> ClientOutcome {
        let counters = &self.counters;
        RelayCounters::bump(&counters.datagrams_received);
        RelayCounters::add(&counters.bytes_received, datagram.len());

        if datagram.len() > self.max_datagram_size {
            RelayCounters::bump(&counters.oversize);
            warn!(
                peer = %peer,
                len = datagram.len(),
                max = self.max_datagram_size,
                "Dropping oversize client datagram"
            );
            return ClientOutcome::Oversize;
        }

        let envelope = match Envelope::parse(datagram) {
            Ok(envelope) => envelope,
            Err(e) => {
                RelayCounters::bump(&counters.malformed);
                warn!(peer = %peer, error = %e, "Dropping malformed client datagram");
                return ClientOutcome::Malformed;
            },
        };

        let key = FlowKey::new(peer, envelope.session);
        let mut opened = None;
        let mut open_failed = None;
        let outcome = self.bindings.resolve_or_bind_with(key.clone(), || {
            let backend = self.selector.select()?;
            match self.open_upstream() {
                Ok(upstream) => {
                    opened = Some(upstream);
                    Some(Route::new(backend, upstream))
                },
                Err(e) => {
                    open_failed = Some((backend, e));
                    None
                },
            }
        });

        let (route, new_binding) = match outcome {
            BindOutcome::Created(route) => {
                info!(
                    session = %key.session,
                    client = %peer,
                    backend = %route.backend,
                    upstream = %route.upstream,
                    "Bound new flow"
                );
                (route, true)
            },
            BindOutcome::Existing(route) => {
                // A concurrent datagram of this flow bound first.
                if let Some(upstream) = opened.filter(|u| *u != route.upstream) {
                    self.release_upstream(upstream);
                }
                (route, false)
            },
            BindOutcome::Unavailable => {
                if let Some((backend, e)) = open_failed {
                    RelayCounters::bump(&counters.send_errors);
                    warn!(
                        session = %key.session,
                        backend = %backend,
                        error = %e,
                        "Failed to open upstream socket, dropping datagram"
                    );
                    return ClientOutcome::UpstreamFailed { backend };
                }
                RelayCounters::bump(&counters.no_backend);
                warn!(
                    session = %key.session,
                    client = %peer,
                    "No backend available, dropping datagram"
                );
                return ClientOutcome::NoBackend;
            },
        };

        let backend = route.backend;
        let Some(socket) = self.upstream_socket(route.upstream) else {
            // The binding was dropped between resolve and send.
            RelayCounters::bump(&counters.send_errors);
            debug!(flow = %key, backend = %backend, "Flow released while forwarding");
            return ClientOutcome::SendFailed { backend };
        };

        let payload = envelope.forward_bytes(self.forward_mode);
        match socket.send_to(payload, backend).await {
            Ok(bytes) => {
                RelayCounters::bump(&counters.datagrams_forwarded);
                RelayCounters::add(&counters.bytes_sent, bytes);
                self.bindings.record_forwarded(&key, bytes);
                debug!(
                    session = %key.session,
                    client = %peer,
                    backend = %backend,
                    bytes,
                    "Forwarded datagram to backend"
                );
                ClientOutcome::Forwarded {
                    backend,
                    bytes,
                    new_binding,
                }
            },
            Err(e) => {
                RelayCounters::bump(&counters.send_errors);
                warn!(backend = %backend, error = %e, "Failed to forward datagram");
                ClientOutcome::SendFailed { backend }
            },
        }
    }

    /// Route one datagram received on the upstream socket `upstream`.
    ///
    /// Only the backend bound to that socket's flow is answered; the reply is
    /// passed to the client unmodified.
    pub async fn handle_backend_datagram(
        &self,
        datagram: &[u8],
        upstream: SocketAddr,
        source: SocketAddr,
    ) -> ReplyOutcome {
        let counters = &self.counters;
        RelayCounters::bump(&counters.datagrams_from_backends);
        RelayCounters::add(&counters.bytes_received, datagram.len());

        if datagram.len() > self.max_datagram_size {
            RelayCounters::bump(&counters.oversize);
            warn!(
                backend = %source,
                len = datagram.len(),
                max = self.max_datagram_size,
                "Dropping oversize backend datagram"
            );
            return ReplyOutcome::Oversize;
        }

        let Some(key) = self.bindings.find_flow(upstream, source) else {
            RelayCounters::bump(&counters.unexpected);
            warn!(
                backend = %source,
                upstream = %upstream,
                "Unexpected traffic from backend, dropping datagram"
            );
            return ReplyOutcome::Unexpected;
        };

        let client = key.client;
        match self.client_socket.send_to(datagram, client).await {
            Ok(bytes) => {
                RelayCounters::bump(&counters.datagrams_to_clients);
                RelayCounters::add(&counters.bytes_sent, bytes);
                self.bindings.record_returned(&key, bytes);
                debug!(
                    session = %key.session,
                    backend = %source,
                    client = %client,
                    bytes,
                    "Returned reply to client"
                );
                ReplyOutcome::Returned { client, bytes }
            },
            Err(e) => {
                RelayCounters::bump(&counters.send_errors);
                warn!(client = %client, error = %e, "Failed to return reply");
                ReplyOutcome::SendFailed { client }
            },
        }
    }

    /// Open an upstream socket for a new flow and start its reply reader.
    ///
    /// The socket is registered before the caller publishes a binding that
    /// names it, so a resolved route always finds its socket.
    fn open_upstream(self: &Arc<Self>) -> UdpRelayResult<SocketAddr> {
        let socket = Arc::new(BoundSocket::bind(self.upstream_bind, "upstream")?);
        let upstream = socket.bound_addr();
        let reader = tokio::spawn(Arc::clone(self).run_reply_loop(Arc::clone(&socket)));

        self.upstreams.insert(
            upstream,
            FlowUpstream {
                socket,
                reader: reader.abort_handle(),
            },
        );
        Ok(upstream)
    }

    fn upstream_socket(&self, upstream: SocketAddr) -> Option<Arc<BoundSocket>> {
        self.upstreams.get(&upstream).map(|u| Arc::clone(&u.socket))
    }

    /// Close an upstream socket and stop its reader.
    fn release_upstream(&self, upstream: SocketAddr) -> bool {
        match self.upstreams.remove(&upstream) {
            Some((_, flow)) => {
                flow.reader.abort();
                debug!(upstream = %upstream, "Released upstream socket");
                true
            },
            None => false,
        }
    }

    /// Drop every binding to `backend` and close their upstream sockets.
    pub fn unbind_backend(&self, backend: SocketAddr) -> usize {
        let removed = self.bindings.unbind_backend(backend);
        for binding in &removed {
            self.release_upstream(binding.upstream);
        }
        removed.len()
    }

    /// Drop bindings idle longer than `timeout` and close their upstream sockets.
    pub fn evict_idle(&self, timeout: Duration) -> usize {
        let removed = self.bindings.evict_idle(timeout);
        for binding in &removed {
            self.release_upstream(binding.upstream);
        }
        removed.len()
    }

    /// Drop every binding and close every upstream socket.
    pub fn release_all(&self) -> usize {
        let removed = self.bindings.clear().len();
        self.upstreams.retain(|_, flow| {
            flow.reader.abort();
            false
        });
        removed
    }

    /// Receive buffer one byte larger than the maximum, so oversize
    /// datagrams are detected instead of silently truncated.
    fn recv_buffer(&self) -> Vec<u8> {
        vec![0u8; self.max_datagram_size + 1]
    }

    /// Serve the client-facing socket until shutdown.
    pub async fn run_client_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut buf = self.recv_buffer();
        info!(addr = %self.client_addr(), "Client listener started");

        loop {
            tokio::select! {
                received = self.client_socket.recv_from(&mut buf) => match received {
                    Ok((n, peer)) => {
                        self.handle_client_datagram(&buf[..n], peer).await;
                    },
                    Err(e) => {
                        RelayCounters::bump(&self.counters.recv_errors);
                        warn!(error = %e, "Client socket receive error");
                    },
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Client listener shutting down");
                        break;
                    }
                },
            }
        }
    }

    /// Serve one flow's upstream socket until it is released or shutdown.
    async fn run_reply_loop(self: Arc<Self>, socket: Arc<BoundSocket>) {
        let mut shutdown = self.shutdown.clone();
        let mut buf = self.recv_buffer();
        let upstream = socket.bound_addr();

        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok((n, source)) => {
                        self.handle_backend_datagram(&buf[..n], upstream, source).await;
                    },
                    // ICMP unreachable from a vanished backend surfaces here.
                    Err(e) => {
                        RelayCounters::bump(&self.counters.recv_errors);
                        debug!(upstream = %upstream, error = %e, "Upstream socket receive error");
                    },
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                },
            }
        }
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("client_socket", &self.client_socket)
            .field("upstream_bind", &self.upstream_bind)
            .field("upstreams", &self.upstreams.len())
            .field("forward_mode", &self.forward_mode)
            .field("max_datagram_size", &self.max_datagram_size)
            .finish()
    }
}

/// Drops bindings to backends that leave the registry.
pub struct BindingPurger {
    forwarder: Arc<Forwarder>,
    backend_port: u16,
}

impl BindingPurger {
    /// Create a purger for a running forwarder.
    #[must_use]
    pub fn new(forwarder: Arc<Forwarder>, backend_port: u16) -> Self {
        Self {
            forwarder,
            backend_port,
        }
    }
}

impl TransitionHandler for BindingPurger {
    fn on_transition(&self, transition: &RegistryTransition) {
        if let RegistryTransition::Removed { entry } = transition {
            if let Some(addr) = entry.socket_addr(self.backend_port) {
                self.forwarder.unbind_backend(addr);
            }
        }
    }
}

/// Periodically evict idle bindings until shutdown.
pub(crate) async fn idle_eviction_task(
    forwarder: Arc<Forwarder>,
    timeout: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = forwarder.evict_idle(timeout);
                if removed > 0 {
                    debug!(
                        removed,
                        remaining = forwarder.bindings.len(),
                        "Idle sweep finished"
                    );
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Idle eviction task shutting down");
                    break;
                }
            },
        }
    }
}
