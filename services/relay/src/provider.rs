//! Listener provider.
//!
//! Relays never bind sockets themselves. They ask a [`ListenerProvider`] for a
//! ready listening socket on the overlay network, which keeps node identity and
//! network authentication out of the relay core.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use async_trait::async_trait;
use tokio::net::{TcpListener, UdpSocket};
use tracing::debug;

use crate::error::RelayError;

/// Transport of a listener, and therefore the mode of the relay using it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => f.write_str("tcp"),
            Transport::Udp => f.write_str("udp"),
        }
    }
}

impl FromStr for Transport {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            other => Err(RelayError::UnknownMode(other.to_string())),
        }
    }
}

/// Source of bound, ready-to-use listening sockets.
#[async_trait]
pub trait ListenerProvider: Send + Sync {
    /// Bind a stream listener on `port`.
    async fn listen_tcp(&self, port: u16) -> Result<TcpListener, RelayError>;

    /// Bind a datagram socket on `port`.
    async fn listen_udp(&self, port: u16) -> Result<UdpSocket, RelayError>;
}

/// Provider that binds on a local interface address.
///
/// When the node joins the overlay through a system daemon, `bind_ip` is the
/// address of its virtual interface.
#[derive(Debug, Clone)]
pub struct LocalListenerProvider {
    bind_ip: IpAddr,
}

impl LocalListenerProvider {
    pub fn new(bind_ip: IpAddr) -> Self {
        Self { bind_ip }
    }

    /// Provider bound to the IPv4 loopback address.
    pub fn loopback() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

#[async_trait]
impl ListenerProvider for LocalListenerProvider {
    async fn listen_tcp(&self, port: u16) -> Result<TcpListener, RelayError> {
        let addr = SocketAddr::new(self.bind_ip, port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Listen {
                transport: Transport::Tcp,
                port,
                source,
            })?;
        debug!(bind_addr = %addr, "tcp listener bound");
        Ok(listener)
    }

    async fn listen_udp(&self, port: u16) -> Result<UdpSocket, RelayError> {
        let addr = SocketAddr::new(self.bind_ip, port);
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| RelayError::Listen {
                transport: Transport::Udp,
                port,
                source,
            })?;
        debug!(bind_addr = %addr, "udp socket bound");
        Ok(socket)
    }
}
