//! UDP transport bound to the S20 protocol port.
//! Plain byte transmission; no knowledge of frame layouts.

use crate::config::Config;
use crate::error::{OrviboError, Result};
use crate::protocol::PORT;
use async_trait::async_trait;
use log::{debug, error, trace, warn};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::time::Duration;

/// Largest datagram read from the socket.
pub const MAX_DATAGRAM: usize = 1024;

/// A datagram and the host it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub source: IpAddr,
    pub payload: Vec<u8>,
}

/// Datagram endpoint shared by every exchange of a client.
///
/// [`UdpTransport`] is the real implementation; anything else (a simulated
/// network, a recording proxy) can be injected through
/// [`Client::with_transport`](crate::Client::with_transport).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send `payload` to `host` on the protocol port.
    async fn send_to(&self, host: IpAddr, payload: &[u8]) -> Result<()>;

    /// Send `payload` to the broadcast address on the protocol port.
    async fn send_broadcast(&self, payload: &[u8]) -> Result<()>;

    /// Wait for the next datagram.
    async fn recv(&self) -> Result<Datagram>;

    /// Wait at most `timeout` for the next datagram; `None` when it elapses.
    async fn receive(&self, timeout: Duration) -> Result<Option<Datagram>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(res) => res.map(Some),
            Err(_) => Ok(None),
        }
    }
}

/// UDP socket on port 10000 with broadcast and address reuse enabled.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    broadcast: SocketAddr,
}

impl UdpTransport {
    /// Bind the protocol port. Must be called within a tokio runtime.
    ///
    /// Address reuse lets several clients (or a restarted one) share the port.
    /// Failing to bind is fatal and is reported as [`OrviboError::Bind`].
    pub fn bind(config: &Config) -> Result<Self> {
        let addr = SocketAddr::new(config.bind_addr, PORT);
        debug!("Creating UDP socket on {}...", addr);
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

        if let Err(e) = socket.set_reuse_address(true) {
            warn!("Failed to set reuse_address on {}: {}", addr, e);
        }
        if let Err(e) = set_reuse_port(&socket) {
            warn!("Failed to set reuse_port on {}: {}", addr, e);
        }
        if let Err(e) = socket.set_broadcast(true) {
            warn!("Failed to set broadcast on {}: {}", addr, e);
        }

        match socket.bind(&SockAddr::from(addr)) {
            Ok(_) => debug!("Successfully bound to {}", addr),
            Err(e) => {
                error!("Failed to bind to {}: {}", addr, e);
                return Err(OrviboError::Bind {
                    addr,
                    reason: e.to_string(),
                });
            }
        }

        socket.set_nonblocking(true)?;
        let std_socket: std::net::UdpSocket = socket.into();
        Ok(Self {
            socket: UdpSocket::from_std(std_socket)?,
            broadcast: SocketAddr::new(IpAddr::V4(config.broadcast_addr), PORT),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_to(&self, host: IpAddr, payload: &[u8]) -> Result<()> {
        let dest = SocketAddr::new(host, PORT);
        let len = self.socket.send_to(payload, dest).await?;
        trace!("Sent {} bytes to {}", len, dest);
        Ok(())
    }

    async fn send_broadcast(&self, payload: &[u8]) -> Result<()> {
        let len = self.socket.send_to(payload, self.broadcast).await?;
        trace!("Sent {} byte broadcast to {}", len, self.broadcast);
        Ok(())
    }

    async fn recv(&self) -> Result<Datagram> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, addr) = self.socket.recv_from(&mut buf).await?;
        trace!("Received {} bytes from {}", len, addr);
        Ok(Datagram {
            source: addr.ip(),
            payload: buf[..len].to_vec(),
        })
    }
}

#[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
fn set_reuse_port(socket: &Socket) -> std::io::Result<()> {
    socket.set_reuse_port(true)
}

#[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos")))))]
fn set_reuse_port(_socket: &Socket) -> std::io::Result<()> {
    Ok(())
}
