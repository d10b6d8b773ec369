//! bulxy relay
//!
//! Exposes TCP and UDP listeners on a private overlay network and relays their
//! traffic to services on the local loopback interface.

pub mod config;
pub mod error;
pub mod logging;
pub mod provider;
pub mod relay;
pub mod supervisor;

pub use config::{Config, LogFormat, ProxyConfig, ProxySpec, RelaySettings};
pub use error::{RelayError, RelayExit};
pub use provider::{ListenerProvider, LocalListenerProvider, Transport};
pub use relay::{
    relay_span, RelayHandle, SessionInfo, SessionTable, TcpRelay, TcpStatsSnapshot, UdpRelay,
    UdpStatsSnapshot,
};
pub use supervisor::Supervisor;
