//! Session binding table for sticky flow routing.
//!
//! A flow (client address plus session id) is bound to one backend on its
//! first datagram and stays bound. Every flow talks to its backend from its
//! own upstream socket, and the reverse map keys on that socket's address, so
//! a reply is routed by where it arrived rather than by what it contains.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

/// Identifies one client flow.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct FlowKey {
    /// Client transport address.
    pub client: SocketAddr,

    /// Client-chosen session id.
    pub session: String,
}

impl FlowKey {
    /// Create a new flow key.
    #[must_use]
    pub fn new(client: SocketAddr, session: impl Into<String>) -> Self {
        Self {
            client,
            session: session.into(),
        }
    }
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.session, self.client)
    }
}

/// Where a bound flow's traffic goes.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct Route {
    /// Bound backend.
    pub backend: SocketAddr,

    /// Local address of the flow's upstream socket.
    pub upstream: SocketAddr,
}

impl Route {
    /// Create a new route.
    #[must_use]
    pub fn new(backend: SocketAddr, upstream: SocketAddr) -> Self {
        Self { backend, upstream }
    }

    fn reverse_key(&self) -> ReverseKey {
        ReverseKey {
            upstream: self.upstream,
            backend: self.backend,
        }
    }
}

/// Key of the reverse map: a backend talking to one flow's upstream socket.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct ReverseKey {
    /// Upstream socket the datagram arrived on.
    pub upstream: SocketAddr,

    /// Backend the datagram came from.
    pub backend: SocketAddr,
}

impl ReverseKey {
    /// Create a new reverse key.
    #[must_use]
    pub fn new(upstream: SocketAddr, backend: SocketAddr) -> Self {
        Self { upstream, backend }
    }
}

/// A flow's binding to a backend.
#[derive(Debug, Clone)]
pub struct Binding {
    /// Bound backend.
    pub backend: SocketAddr,

    /// Local address of the flow's upstream socket.
    pub upstream: SocketAddr,

    /// When the binding was created.
    pub created_at: Instant,

    /// Last datagram in either direction.
    pub last_activity: Instant,

    /// Datagrams forwarded (client -> backend).
    pub datagrams_forwarded: u64,

    /// Datagrams returned (backend -> client).
    pub datagrams_returned: u64,

    /// Bytes forwarded to the backend.
    pub bytes_forwarded: u64,

    /// Bytes returned to the client.
    pub bytes_returned: u64,
}

impl Binding {
    /// Create a new binding.
    #[must_use]
    pub fn new(route: Route) -> Self {
        let now = Instant::now();
        Self {
            backend: route.backend,
            upstream: route.upstream,
            created_at: now,
            last_activity: now,
            datagrams_forwarded: 0,
            datagrams_returned: 0,
            bytes_forwarded: 0,
            bytes_returned: 0,
        }
    }

    /// The binding's route.
    #[must_use]
    pub fn route(&self) -> Route {
        Route::new(self.backend, self.upstream)
    }

    /// Check if the binding has been idle longer than `timeout` at `now`.
    #[must_use]
    pub fn is_idle_at(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_activity) > timeout
    }

    fn record_forwarded(&mut self, bytes: usize) {
        self.datagrams_forwarded += 1;
        self.bytes_forwarded += bytes as u64;
        self.last_activity = Instant::now();
    }

    fn record_returned(&mut self, bytes: usize) {
        self.datagrams_returned += 1;
        self.bytes_returned += bytes as u64;
        self.last_activity = Instant::now();
    }
}

/// Result of binding a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// The flow was already bound. A racing bind of the same flow that lost
    /// also gets this, carrying the winner's route.
    Existing(Route),

    /// The flow was bound by this call.
    Created(Route),

    /// The flow is unbound and selection found nothing.
    Unavailable,
}

impl BindOutcome {
    /// The route the flow is bound to, if any.
    #[must_use]
    pub fn route(&self) -> Option<Route> {
        match self {
            Self::Existing(route) | Self::Created(route) => Some(*route),
            Self::Unavailable => None,
        }
    }

    /// The backend the flow is bound to, if any.
    #[must_use]
    pub fn backend(&self) -> Option<SocketAddr> {
        self.route().map(|r| r.backend)
    }
}

/// Statistics for the binding table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingStats {
    /// Bindings currently held.
    pub active_bindings: usize,

    /// Bindings created.
    pub total_created: u64,

    /// Binds that lost a race and adopted the winner's route.
    pub races_lost: u64,

    /// Forward lookups.
    pub lookups: u64,

    /// Forward lookups that found a binding.
    pub lookup_hits: u64,

    /// Bindings evicted for idleness.
    pub evicted: u64,

    /// Bindings dropped because their backend went away.
    pub unbound: u64,
}

/// Inner statistics (atomic counters).
#[derive(Default)]
struct BindingStatsInner {
    total_created: AtomicU64,
    races_lost: AtomicU64,
    lookups: AtomicU64,
    lookup_hits: AtomicU64,
    evicted: AtomicU64,
    unbound: AtomicU64,
}

/// Concurrent flow → backend table.
///
/// Both maps are sharded and a shard lock is only held for a map operation,
/// never across selection. The first bind of a key wins; any later bind of
/// the same key gets the winner's route back. Lock order is always forward
/// then reverse.
#[derive(Default)]
pub struct BindingTable {
    /// Flow -> binding.
    forward: DashMap<FlowKey, Binding>,

    /// (upstream socket, backend) -> flow, for reply routing.
    reverse: DashMap<ReverseKey, FlowKey>,

    /// Statistics.
    stats: BindingStatsInner,
}

impl BindingTable {
    /// Create an empty binding table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the backend a flow is bound to.
    #[must_use]
    pub fn resolve(&self, key: &FlowKey) -> Option<SocketAddr> {
        self.resolve_route(key).map(|r| r.backend)
    }

    /// Look up a flow's full route.
    #[must_use]
    pub fn resolve_route(&self, key: &FlowKey) -> Option<Route> {
        self.stats.lookups.fetch_add(1, Ordering::Relaxed);
        let route = self.forward.get(key).map(|b| b.route());
        if route.is_some() {
            self.stats.lookup_hits.fetch_add(1, Ordering::Relaxed);
        }
        route
    }

    /// Get a copy of a flow's binding.
    #[must_use]
    pub fn get(&self, key: &FlowKey) -> Option<Binding> {
        self.forward.get(key).map(|b| b.clone())
    }

    /// Bind a flow unless it is already bound.
    ///
    /// Forward and reverse entries are written while the flow's entry is
    /// held, so a concurrent bind of the same key sees either nothing or
    /// both. Only the first bind of a key takes effect.
    pub fn bind(&self, key: FlowKey, route: Route) -> BindOutcome {
        match self.forward.entry(key) {
            Entry::Occupied(entry) => {
                self.stats.races_lost.fetch_add(1, Ordering::Relaxed);
                BindOutcome::Existing(entry.get().route())
            },
            Entry::Vacant(entry) => {
                self.reverse.insert(route.reverse_key(), entry.key().clone());
                debug!(
                    flow = %entry.key(),
                    backend = %route.backend,
                    upstream = %route.upstream,
                    "Created new binding"
                );
                entry.insert(Binding::new(route));
                self.stats.total_created.fetch_add(1, Ordering::Relaxed);
                BindOutcome::Created(route)
            },
        }
    }

    /// Resolve a flow, or select a route and bind it.
    ///
    /// `select` runs without any table lock held and only while the flow is
    /// unbound. Concurrent first datagrams of one flow may each select, but
    /// exactly one route is bound and every caller gets that route back.
    pub fn resolve_or_bind_with<F>(&self, key: FlowKey, select: F) -> BindOutcome
    where
        F: FnOnce() -> Option<Route>,
    {
        if let Some(route) = self.resolve_route(&key) {
            return BindOutcome::Existing(route);
        }

        match select() {
            Some(route) => self.bind(key, route),
            None => BindOutcome::Unavailable,
        }
    }

    /// Find the flow whose upstream socket `upstream` talks to `backend`.
    #[must_use]
    pub fn find_flow(&self, upstream: SocketAddr, backend: SocketAddr) -> Option<FlowKey> {
        self.reverse
            .get(&ReverseKey::new(upstream, backend))
            .map(|k| k.clone())
    }

    /// Find the client that owns the flow on `upstream` bound to `backend`.
    #[must_use]
    pub fn find_client(&self, upstream: SocketAddr, backend: SocketAddr) -> Option<SocketAddr> {
        self.find_flow(upstream, backend).map(|k| k.client)
    }

    /// Update a binding after forwarding a datagram.
    pub fn record_forwarded(&self, key: &FlowKey, bytes: usize) {
        if let Some(mut binding) = self.forward.get_mut(key) {
            binding.record_forwarded(bytes);
        }
    }

    /// Update a binding after returning a reply.
    pub fn record_returned(&self, key: &FlowKey, bytes: usize) {
        if let Some(mut binding) = self.forward.get_mut(key) {
            binding.record_returned(bytes);
        }
    }

    /// Drop every binding to `backend`, returning the removed bindings.
    pub fn unbind_backend(&self, backend: SocketAddr) -> Vec<Binding> {
        let removed = self.remove_where(|_, binding| binding.backend == backend);
        if !removed.is_empty() {
            self.stats
                .unbound
                .fetch_add(removed.len() as u64, Ordering::Relaxed);
            info!(
                backend = %backend,
                removed = removed.len(),
                "Dropped bindings to departed backend"
            );
        }
        removed
    }

    /// Drop bindings idle longer than `timeout`, returning the removed bindings.
    pub fn evict_idle(&self, timeout: Duration) -> Vec<Binding> {
        let now = Instant::now();
        let removed = self.remove_where(|_, binding| binding.is_idle_at(now, timeout));
        if !removed.is_empty() {
            self.stats
                .evicted
                .fetch_add(removed.len() as u64, Ordering::Relaxed);
            debug!(removed = removed.len(), "Evicted idle bindings");
        }
        removed
    }

    /// Drop every binding, returning them.
    pub fn clear(&self) -> Vec<Binding> {
        self.remove_where(|_, _| true)
    }

    fn remove_where<F>(&self, mut predicate: F) -> Vec<Binding>
    where
        F: FnMut(&FlowKey, &Binding) -> bool,
    {
        let mut removed = Vec::new();
        self.forward.retain(|key, binding| {
            if !predicate(key, binding) {
                return true;
            }
            self.reverse.remove(&binding.route().reverse_key());
            removed.push(binding.clone());
            false
        });
        removed
    }

    /// Number of bound flows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// Whether no flow is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Get binding table statistics.
    #[must_use]
    pub fn stats(&self) -> BindingStats {
        BindingStats {
            active_bindings: self.forward.len(),
            total_created: self.stats.total_created.load(Ordering::Relaxed),
            races_lost: self.stats.races_lost.load(Ordering::Relaxed),
            lookups: self.stats.lookups.load(Ordering::Relaxed),
            lookup_hits: self.stats.lookup_hits.load(Ordering::Relaxed),
            evicted: self.stats.evicted.load(Ordering::Relaxed),
            unbound: self.stats.unbound.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for BindingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingTable")
            .field("bindings", &self.forward.len())
            .field("reverse", &self.reverse.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn make_addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    /// Route to backend `backend` through upstream socket port `upstream`.
    fn route(backend: u16, upstream: u16) -> Route {
        Route::new(make_addr(backend), make_addr(upstream))
    }

    #[test]
    fn test_bind_and_resolve() {
        let table = BindingTable::new();
        let key = FlowKey::new(make_addr(40000), "sess1");

        assert_eq!(table.resolve(&key), None);
        assert_eq!(table.bind(key.clone(), route(1234, 50000)), BindOutcome::Created(route(1234, 50000)));
        assert_eq!(table.resolve(&key), Some(make_addr(1234)));
        assert_eq!(table.resolve_route(&key), Some(route(1234, 50000)));
        assert_eq!(
            table.find_client(make_addr(50000), make_addr(1234)),
            Some(make_addr(40000))
        );
        assert_eq!(table.find_flow(make_addr(50000), make_addr(1234)), Some(key));
    }

    #[test]
    fn test_binding_never_overwritten() {
        let table = BindingTable::new();
        let key = FlowKey::new(make_addr(40000), "sess1");

        table.bind(key.clone(), route(1234, 50000));
        assert_eq!(
            table.bind(key.clone(), route(5678, 50001)),
            BindOutcome::Existing(route(1234, 50000))
        );
        assert_eq!(table.resolve(&key), Some(make_addr(1234)));
        assert_eq!(table.find_client(make_addr(50001), make_addr(5678)), None);
        assert_eq!(table.len(), 1);
        assert_eq!(table.stats().races_lost, 1);
    }

    #[test]
    fn test_flow_key_includes_client() {
        let table = BindingTable::new();
        table.bind(FlowKey::new(make_addr(40000), "sess1"), route(1234, 50000));

        // Same session id from a different client is a different flow.
        let other = FlowKey::new(make_addr(40001), "sess1");
        assert_eq!(table.resolve(&other), None);
    }

    #[test]
    fn test_shared_session_id_keeps_separate_reverse_routes() {
        let table = BindingTable::new();
        let a = FlowKey::new(make_addr(40000), "sess1");
        let b = FlowKey::new(make_addr(40001), "sess1");
        table.bind(a.clone(), route(1234, 50000));
        table.bind(b.clone(), route(1234, 50001));

        assert_eq!(table.find_client(make_addr(50000), make_addr(1234)), Some(make_addr(40000)));
        assert_eq!(table.find_client(make_addr(50001), make_addr(1234)), Some(make_addr(40001)));

        // Removing one flow leaves the other's reply route alone.
        assert_eq!(table.remove_where(|key, _| key == &a).len(), 1);
        assert_eq!(table.find_client(make_addr(50000), make_addr(1234)), None);
        assert_eq!(table.find_client(make_addr(50001), make_addr(1234)), Some(make_addr(40001)));
    }

    #[test]
    fn test_reply_from_other_backend_not_routed() {
        let table = BindingTable::new();
        table.bind(FlowKey::new(make_addr(40000), "sess1"), route(1234, 50000));

        assert_eq!(table.find_client(make_addr(50000), make_addr(5678)), None);
    }

    #[test]
    fn test_selection_skipped_once_bound() {
        let table = BindingTable::new();
        let key = FlowKey::new(make_addr(40000), "sess1");
        let calls = AtomicUsize::new(0);

        let select = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Some(route(1234, 50000))
        };
        assert_eq!(
            table.resolve_or_bind_with(key.clone(), select),
            BindOutcome::Created(route(1234, 50000))
        );
        assert_eq!(
            table.resolve_or_bind_with(key, select),
            BindOutcome::Existing(route(1234, 50000))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_selection_runs_without_table_lock() {
        let table = BindingTable::new();
        let first = FlowKey::new(make_addr(40000), "sess1");
        let second = FlowKey::new(make_addr(40001), "sess2");

        // Binding another flow from inside selection would deadlock if the
        // selecting call held a shard lock.
        let outcome = table.resolve_or_bind_with(first.clone(), || {
            table.bind(second.clone(), route(5678, 50001));
            assert_eq!(table.resolve(&second), Some(make_addr(5678)));
            Some(route(1234, 50000))
        });

        assert_eq!(outcome, BindOutcome::Created(route(1234, 50000)));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_unavailable_leaves_flow_unbound() {
        let table = BindingTable::new();
        let key = FlowKey::new(make_addr(40000), "sess1");

        assert_eq!(
            table.resolve_or_bind_with(key.clone(), || None),
            BindOutcome::Unavailable
        );
        assert!(table.is_empty());
        assert_eq!(table.resolve(&key), None);
    }

    #[test]
    fn test_counters() {
        let table = BindingTable::new();
        let key = FlowKey::new(make_addr(40000), "sess1");
        table.bind(key.clone(), route(1234, 50000));

        table.record_forwarded(&key, 5);
        table.record_forwarded(&key, 4);
        table.record_returned(&key, 20);

        let binding = table.get(&key).unwrap();
        assert_eq!(binding.datagrams_forwarded, 2);
        assert_eq!(binding.bytes_forwarded, 9);
        assert_eq!(binding.datagrams_returned, 1);
        assert_eq!(binding.bytes_returned, 20);
    }

    #[test]
    fn test_unbind_backend() {
        let table = BindingTable::new();
        let a = FlowKey::new(make_addr(40000), "a");
        let b = FlowKey::new(make_addr(40001), "b");
        table.bind(a.clone(), route(1234, 50000));
        table.bind(b.clone(), route(5678, 50001));

        let removed = table.unbind_backend(make_addr(1234));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].upstream, make_addr(50000));
        assert_eq!(table.resolve(&a), None);
        assert_eq!(table.find_client(make_addr(50000), make_addr(1234)), None);
        assert_eq!(table.resolve(&b), Some(make_addr(5678)));
        assert_eq!(table.stats().unbound, 1);
    }

    #[test]
    fn test_evict_idle() {
        let table = BindingTable::new();
        let key = FlowKey::new(make_addr(40000), "sess1");
        table.bind(key.clone(), route(1234, 50000));

        assert!(table.evict_idle(Duration::from_secs(60)).is_empty());

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(table.evict_idle(Duration::from_millis(1)).len(), 1);
        assert!(table.is_empty());
        assert_eq!(table.find_client(make_addr(50000), make_addr(1234)), None);
        assert_eq!(table.stats().evicted, 1);
    }

    #[test]
    fn test_clear() {
        let table = BindingTable::new();
        table.bind(FlowKey::new(make_addr(40000), "a"), route(1234, 50000));
        table.bind(FlowKey::new(make_addr(40001), "b"), route(1234, 50001));

        assert_eq!(table.clear().len(), 2);
        assert!(table.is_empty());
        assert_eq!(table.find_client(make_addr(50001), make_addr(1234)), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_datagrams_bind_once() {
        let table = Arc::new(BindingTable::new());
        let key = FlowKey::new(make_addr(40000), "race");

        let mut handles = Vec::new();
        for i in 0..16u16 {
            let table = Arc::clone(&table);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                table.resolve_or_bind_with(key, || Some(route(2000 + i, 50000 + i)))
            }));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap());
        }

        let created = outcomes
            .iter()
            .filter(|o| matches!(o, BindOutcome::Created(_)))
            .count();
        assert_eq!(created, 1);

        let routes: Vec<Route> = outcomes.iter().filter_map(BindOutcome::route).collect();
        assert_eq!(routes.len(), 16);
        assert!(routes.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(table.resolve_route(&key), Some(routes[0]));
        assert_eq!(table.len(), 1);
        assert_eq!(table.stats().total_created, 1);
    }
}
