//! Named UDP socket used for both sides of the relay.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tracing::{debug, trace};

use super::error::{UdpRelayError, UdpRelayResult};

/// A bound UDP socket tagged with the side of the relay it serves.
pub struct BoundSocket {
    socket: UdpSocket,
    bound_addr: SocketAddr,
    name: &'static str,
}

impl BoundSocket {
    /// Bind a new UDP socket.
    ///
    /// Binding is synchronous so callers outside an async context learn about
    /// failures immediately. Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub fn bind(addr: SocketAddr, name: &'static str) -> UdpRelayResult<Self> {
        let bind_error = |source| UdpRelayError::BindError {
            address: addr,
            source,
        };

        let std_socket = std::net::UdpSocket::bind(addr).map_err(bind_error)?;
        std_socket.set_nonblocking(true).map_err(bind_error)?;
        let socket = UdpSocket::from_std(std_socket).map_err(bind_error)?;
        let bound_addr = socket.local_addr().map_err(bind_error)?;

        debug!(name, address = %bound_addr, "UDP socket bound");

        Ok(Self {
            socket,
            bound_addr,
            name,
        })
    }

    /// Get the bound address.
    #[must_use]
    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    /// Get the socket name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Receive one datagram into `buf`, returning its length and source.
    ///
    /// # Errors
    ///
    /// Returns [`UdpRelayError::RecvError`] if the receive fails.
    pub async fn recv_from(&self, buf: &mut [u8]) -> UdpRelayResult<(usize, SocketAddr)> {
        let (len, peer) = self
            .socket
            .recv_from(buf)
            .await
            .map_err(UdpRelayError::RecvError)?;
        trace!(socket = self.name, len, peer = %peer, "Received datagram");
        Ok((len, peer))
    }

    /// Send one datagram to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`UdpRelayError::SendError`] if the send fails.
    pub async fn send_to(&self, buf: &[u8], target: SocketAddr) -> UdpRelayResult<usize> {
        let len = self
            .socket
            .send_to(buf, target)
            .await
            .map_err(|source| UdpRelayError::SendError {
                address: target,
                source,
            })?;
        trace!(socket = self.name, len, target = %target, "Sent datagram");
        Ok(len)
    }
}

impl std::fmt::Debug for BoundSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundSocket")
            .field("name", &self.name)
            .field("bound_addr", &self.bound_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_socket_bind() {
        let socket = BoundSocket::bind(loopback(), "client").unwrap();

        assert_ne!(socket.bound_addr().port(), 0);
        assert_eq!(socket.name(), "client");
    }

    #[tokio::test]
    async fn test_socket_bind_in_use() {
        let first = BoundSocket::bind(loopback(), "client").unwrap();
        let result = BoundSocket::bind(first.bound_addr(), "client");

        assert!(matches!(result, Err(UdpRelayError::BindError { .. })));
    }

    #[tokio::test]
    async fn test_socket_send_recv() {
        let socket1 = BoundSocket::bind(loopback(), "one").unwrap();
        let socket2 = BoundSocket::bind(loopback(), "two").unwrap();

        let data = b"sess1|hello";
        socket1.send_to(data, socket2.bound_addr()).await.unwrap();

        let mut buf = [0u8; 1024];
        let (len, from) = socket2.recv_from(&mut buf).await.unwrap();

        assert_eq!(&buf[..len], data);
        assert_eq!(from, socket1.bound_addr());
    }
}
