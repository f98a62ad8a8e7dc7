//! End-to-end relay behavior over loopback sockets.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use r0n_relay::module::{ModuleConfig, ModuleContract};
use r0n_relay::modules::registry::{BackendEntry, BackendRegistry, WatchEvent};
use r0n_relay::modules::udp_relay::{
    BackendSelector, FlowKey, ForwardMode, RelaySettings, Route, UdpRelay,
};
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const WAIT: Duration = Duration::from_secs(2);

fn loopback_settings() -> RelaySettings {
    RelaySettings::default()
        .with_address(LOCALHOST)
        .with_listen_port(0)
}

fn start_relay(settings: RelaySettings) -> UdpRelay {
    let mut relay = UdpRelay::new(Arc::new(BackendRegistry::new()));
    relay
        .init(ModuleConfig::from_settings(&settings).unwrap())
        .unwrap();
    relay.start().unwrap();
    relay
}

async fn loopback_socket() -> UdpSocket {
    UdpSocket::bind((LOCALHOST, 0)).await.unwrap()
}

/// Registry entry whose address carries the backend socket's own port.
fn entry_for(name: &str, backend: &UdpSocket) -> BackendEntry {
    BackendEntry::new(name, backend.local_addr().unwrap().to_string()).with_ready(true)
}

async fn recv(socket: &UdpSocket) -> Option<(Vec<u8>, SocketAddr)> {
    let mut buf = vec![0u8; 2048];
    match timeout(WAIT, socket.recv_from(&mut buf)).await {
        Ok(Ok((len, from))) => Some((buf[..len].to_vec(), from)),
        _ => None,
    }
}

async fn recv_nothing(socket: &UdpSocket) -> bool {
    let mut buf = vec![0u8; 2048];
    timeout(Duration::from_millis(200), socket.recv_from(&mut buf))
        .await
        .is_err()
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_empty_registry_drops_datagram() {
    let mut relay = start_relay(loopback_settings());
    let client = loopback_socket().await;

    client
        .send_to(b"sess1|hello", relay.client_addr().unwrap())
        .await
        .unwrap();

    assert!(eventually(|| relay.stats().no_backend == 1).await);
    assert!(relay.bindings().is_empty());

    relay.stop().unwrap();
}

#[tokio::test]
async fn test_first_datagram_binds_and_forwards_payload() {
    let mut relay = start_relay(loopback_settings());
    let client = loopback_socket().await;
    let b1 = loopback_socket().await;
    relay
        .registry()
        .apply(WatchEvent::Added(entry_for("server-1", &b1)))
        .unwrap();

    client
        .send_to(b"sess1|hello", relay.client_addr().unwrap())
        .await
        .unwrap();

    let (payload, from) = recv(&b1).await.expect("backend received nothing");
    assert_eq!(payload, b"hello");

    let key = FlowKey::new(client.local_addr().unwrap(), "sess1");
    assert_eq!(relay.bindings().resolve(&key), Some(b1.local_addr().unwrap()));
    assert_eq!(relay.bindings().get(&key).unwrap().upstream, from);
    assert_eq!(relay.bindings().len(), 1);

    relay.stop().unwrap();
}

#[tokio::test]
async fn test_datagram_mode_forwards_whole_envelope() {
    let mut relay = start_relay(loopback_settings().with_forward_mode(ForwardMode::Datagram));
    let client = loopback_socket().await;
    let b1 = loopback_socket().await;
    relay
        .registry()
        .apply(WatchEvent::Added(entry_for("server-1", &b1)))
        .unwrap();

    client
        .send_to(b"sess1|hello", relay.client_addr().unwrap())
        .await
        .unwrap();

    let (payload, _) = recv(&b1).await.expect("backend received nothing");
    assert_eq!(payload, b"sess1|hello");

    relay.stop().unwrap();
}

#[tokio::test]
async fn test_draining_backend_keeps_existing_flow_only() {
    let mut relay = start_relay(loopback_settings());
    let client = loopback_socket().await;
    let b1 = loopback_socket().await;
    let b2 = loopback_socket().await;
    let relay_addr = relay.client_addr().unwrap();

    relay
        .registry()
        .apply(WatchEvent::Added(entry_for("server-1", &b1)))
        .unwrap();
    client.send_to(b"sess1|hello", relay_addr).await.unwrap();
    assert_eq!(recv(&b1).await.unwrap().0, b"hello");

    relay
        .registry()
        .apply(WatchEvent::Updated(
            entry_for("server-1", &b1).with_terminating(true),
        ))
        .unwrap();
    relay
        .registry()
        .apply(WatchEvent::Added(entry_for("server-2", &b2)))
        .unwrap();

    // Existing flow sticks to the draining backend.
    client.send_to(b"sess1|ping", relay_addr).await.unwrap();
    assert_eq!(recv(&b1).await.unwrap().0, b"ping");

    // A new flow goes elsewhere.
    client.send_to(b"sess2|ping", relay_addr).await.unwrap();
    assert_eq!(recv(&b2).await.unwrap().0, b"ping");
    assert!(recv_nothing(&b1).await);

    relay.stop().unwrap();
}

#[tokio::test]
async fn test_removed_backend_stays_bound_by_default() {
    let mut relay = start_relay(loopback_settings());
    let client = loopback_socket().await;
    let b1 = loopback_socket().await;
    let relay_addr = relay.client_addr().unwrap();

    relay
        .registry()
        .apply(WatchEvent::Added(entry_for("server-1", &b1)))
        .unwrap();
    client.send_to(b"sess1|hello", relay_addr).await.unwrap();
    assert!(recv(&b1).await.is_some());

    relay
        .registry()
        .apply(WatchEvent::Removed(entry_for("server-1", &b1)))
        .unwrap();

    client.send_to(b"sess1|again", relay_addr).await.unwrap();
    assert_eq!(recv(&b1).await.unwrap().0, b"again");

    relay.stop().unwrap();
}

#[tokio::test]
async fn test_rebind_on_removal_moves_flow() {
    let mut settings = loopback_settings();
    settings.rebind_on_removal = true;
    let mut relay = start_relay(settings);
    let client = loopback_socket().await;
    let b1 = loopback_socket().await;
    let b2 = loopback_socket().await;
    let relay_addr = relay.client_addr().unwrap();

    relay
        .registry()
        .apply(WatchEvent::Added(entry_for("server-1", &b1)))
        .unwrap();
    client.send_to(b"sess1|hello", relay_addr).await.unwrap();
    assert!(recv(&b1).await.is_some());

    relay
        .registry()
        .apply(WatchEvent::Added(entry_for("server-2", &b2)))
        .unwrap();
    relay
        .registry()
        .apply(WatchEvent::Removed(entry_for("server-1", &b1)))
        .unwrap();
    assert!(eventually(|| relay.bindings().is_empty()).await);

    client.send_to(b"sess1|again", relay_addr).await.unwrap();
    assert_eq!(recv(&b2).await.unwrap().0, b"again");

    relay.stop().unwrap();
}

#[tokio::test]
async fn test_reply_from_unbound_backend_dropped() {
    let mut relay = start_relay(loopback_settings());
    let client = loopback_socket().await;
    let b0 = loopback_socket().await;
    let b1 = loopback_socket().await;
    let relay_addr = relay.client_addr().unwrap();

    relay
        .registry()
        .apply(WatchEvent::Added(entry_for("server-0", &b0)))
        .unwrap();
    relay
        .registry()
        .apply(WatchEvent::Added(entry_for("server-1", &b1)))
        .unwrap();

    // First fit binds the flow to server-0.
    client.send_to(b"sess1|hello", relay_addr).await.unwrap();
    let (_, upstream) = recv(&b0).await.expect("backend received nothing");

    // B1 is registered but has no reverse binding on this socket.
    b1.send_to(b"sess1|surprise", upstream).await.unwrap();

    assert!(eventually(|| relay.stats().unexpected == 1).await);
    assert_eq!(relay.stats().datagrams_to_clients, 0);
    assert!(recv_nothing(&client).await);

    relay.stop().unwrap();
}

#[tokio::test]
async fn test_reply_routed_to_bound_client() {
    let mut relay = start_relay(loopback_settings());
    let client = loopback_socket().await;
    let b1 = loopback_socket().await;
    let relay_addr = relay.client_addr().unwrap();

    relay
        .registry()
        .apply(WatchEvent::Added(entry_for("server-1", &b1)))
        .unwrap();
    client.send_to(b"sess1|hello", relay_addr).await.unwrap();
    let (_, upstream) = recv(&b1).await.expect("backend received nothing");

    b1.send_to(b"sess1|world", upstream).await.unwrap();

    let (reply, from) = recv(&client).await.expect("client received nothing");
    assert_eq!(reply, b"sess1|world");
    assert_eq!(from, relay_addr);

    relay.stop().unwrap();
}

#[tokio::test]
async fn test_plain_reply_routed_in_payload_mode() {
    let mut relay = start_relay(loopback_settings());
    let client = loopback_socket().await;
    let b1 = loopback_socket().await;
    let relay_addr = relay.client_addr().unwrap();

    relay
        .registry()
        .apply(WatchEvent::Added(entry_for("server-1", &b1)))
        .unwrap();
    client.send_to(b"sess1|hello", relay_addr).await.unwrap();
    let (payload, upstream) = recv(&b1).await.expect("backend received nothing");
    assert_eq!(payload, b"hello");

    // The backend never saw the session id and answers without one.
    b1.send_to(b"pong", upstream).await.unwrap();

    let (reply, from) = recv(&client).await.expect("client received nothing");
    assert_eq!(reply, b"pong");
    assert_eq!(from, relay_addr);
    assert_eq!(relay.stats().malformed, 0);

    relay.stop().unwrap();
}

#[tokio::test]
async fn test_shared_session_id_replies_stay_with_their_client() {
    let mut relay = start_relay(loopback_settings().with_forward_mode(ForwardMode::Datagram));
    let client_a = loopback_socket().await;
    let client_b = loopback_socket().await;
    let b1 = loopback_socket().await;
    let relay_addr = relay.client_addr().unwrap();

    relay
        .registry()
        .apply(WatchEvent::Added(entry_for("server-1", &b1)))
        .unwrap();

    client_a.send_to(b"sess1|from-a", relay_addr).await.unwrap();
    let (payload, upstream_a) = recv(&b1).await.expect("backend received nothing");
    assert_eq!(payload, b"sess1|from-a");

    client_b.send_to(b"sess1|from-b", relay_addr).await.unwrap();
    let (payload, upstream_b) = recv(&b1).await.expect("backend received nothing");
    assert_eq!(payload, b"sess1|from-b");
    assert_ne!(upstream_a, upstream_b);

    b1.send_to(b"sess1|reply-for-a", upstream_a).await.unwrap();

    let (reply, _) = recv(&client_a).await.expect("client A received nothing");
    assert_eq!(reply, b"sess1|reply-for-a");
    assert!(recv_nothing(&client_b).await);

    relay.stop().unwrap();
}

#[test]
fn test_concurrent_first_datagrams_bind_once() {
    let registry = Arc::new(BackendRegistry::new());
    let relay = UdpRelay::new(Arc::clone(&registry));
    let bindings = Arc::clone(relay.bindings());
    let selector = Arc::new(BackendSelector::new(Arc::clone(&registry), 1234));
    let key = FlowKey::new("10.0.0.5:40000".parse().unwrap(), "sess1");

    let barrier = Arc::new(Barrier::new(3));
    let senders: Vec<_> = (0..2u16)
        .map(|i| {
            let bindings = Arc::clone(&bindings);
            let selector = Arc::clone(&selector);
            let barrier = Arc::clone(&barrier);
            let key = key.clone();
            // Each sender would carry the flow on its own upstream socket.
            let upstream = SocketAddr::new(LOCALHOST, 50000 + i);
            thread::spawn(move || {
                barrier.wait();
                // A client keeps retrying until its datagram is forwarded.
                loop {
                    let outcome = bindings.resolve_or_bind_with(key.clone(), || {
                        selector.select().map(|backend| Route::new(backend, upstream))
                    });
                    if let Some(route) = outcome.route() {
                        return route;
                    }
                    thread::yield_now();
                }
            })
        })
        .collect();

    barrier.wait();
    thread::sleep(Duration::from_millis(5));
    registry
        .apply(WatchEvent::Added(
            BackendEntry::new("server-1", "10.0.0.1").with_ready(true),
        ))
        .unwrap();

    let chosen: Vec<Route> = senders.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(chosen[0], chosen[1]);
    assert_eq!(chosen[0].backend, "10.0.0.1:1234".parse::<SocketAddr>().unwrap());
    assert_eq!(bindings.stats().total_created, 1);
    assert_eq!(bindings.len(), 1);
}
