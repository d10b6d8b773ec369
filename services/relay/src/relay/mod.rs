//! Connection relay engine.
//!
//! This module provides:
//! - TCP relaying: one task per accepted connection, bytes piped both ways
//! - UDP relaying: per-client sessions multiplexed over one listening socket
//! - Idle session expiry for UDP
//!
//! ## Architecture
//!
//! ```text
//! ListenerProvider -> TcpRelay -> per-connection task -> 127.0.0.1:to
//!                  -> UdpRelay -> SessionTable -> per-session socket -> 127.0.0.1:to
//! ```
//!
//! Every relay owns one cancellation signal (a `watch` channel). `stop()`
//! sets it and returns once every task of that relay has exited.

mod session;
mod stats;
mod tcp;
mod udp;

use std::net::SocketAddr;

use tokio::sync::watch;
use tracing::Span;

pub use session::{Activity, Session, SessionHandle, SessionInfo, SessionTable};
pub use stats::{TcpRelayStats, TcpStatsSnapshot, UdpRelayStats, UdpStatsSnapshot};
pub use tcp::TcpRelay;
pub use udp::UdpRelay;

use crate::config::{ProxySpec, RelaySettings};
use crate::error::{RelayError, RelayExit};
use crate::provider::{ListenerProvider, Transport};

/// Resolves once the relay's cancellation signal is set, or its sender is gone.
pub(crate) async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

/// Span every task of a relay runs in.
pub fn relay_span(spec: &ProxySpec) -> Span {
    tracing::info_span!(
        "relay",
        name = %spec.name,
        mode = %spec.mode,
        from = spec.from_port,
        to = spec.to_port,
    )
}

/// A running relay of either transport.
pub enum RelayHandle {
    Tcp(TcpRelay),
    Udp(UdpRelay),
}

impl RelayHandle {
    /// Start the relay matching `spec.mode`.
    pub async fn start(
        spec: ProxySpec,
        provider: &dyn ListenerProvider,
        settings: &RelaySettings,
    ) -> Result<Self, RelayError> {
        let span = relay_span(&spec);
        match spec.mode {
            Transport::Tcp => Ok(RelayHandle::Tcp(
                TcpRelay::start(spec, provider, settings, span).await?,
            )),
            Transport::Udp => Ok(RelayHandle::Udp(
                UdpRelay::start(spec, provider, settings, span).await?,
            )),
        }
    }

    pub fn spec(&self) -> &ProxySpec {
        match self {
            RelayHandle::Tcp(relay) => relay.spec(),
            RelayHandle::Udp(relay) => relay.spec(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        match self {
            RelayHandle::Tcp(relay) => relay.local_addr(),
            RelayHandle::Udp(relay) => relay.local_addr(),
        }
    }

    pub async fn stop(self) -> RelayExit {
        match self {
            RelayHandle::Tcp(relay) => relay.stop().await,
            RelayHandle::Udp(relay) => relay.stop().await,
        }
    }
}
