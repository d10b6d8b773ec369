//! Relay configuration.
//!
//! Loaded from a TOML file:
//!
//! ```toml
//! hostname = "media-box"
//! bind_addr = "100.64.0.7"
//!
//! [relay]
//! udp_idle_timeout_secs = 120
//!
//! [proxy.minecraft]
//! from = 25565
//! to = 25565
//! mode = "tcp"
//! ```
//!
//! Tables belonging to other subsystems (`[file.*]`, `dashboard`) are ignored.

use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::RelayError;
use crate::provider::Transport;

/// Default idle timeout for UDP sessions.
pub const DEFAULT_UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default interval between idle-session sweeps.
pub const DEFAULT_UDP_REAP_INTERVAL: Duration = Duration::from_secs(10);

/// Default connect timeout for backend dials.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Default datagram buffer size (largest UDP payload).
pub const DEFAULT_UDP_BUFFER_SIZE: usize = 65535;

const MIN_UDP_BUFFER_SIZE: usize = 512;

/// Log level used when the config sets none, or could not be loaded.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Node name on the overlay network.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Address the listener provider binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,

    /// Relay tunables.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Proxy entries keyed by name.
    #[serde(default)]
    pub proxy: BTreeMap<String, ProxyConfig>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// `[relay]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub udp_idle_timeout_secs: u64,
    pub udp_reap_interval_secs: u64,
    pub dial_timeout_ms: u64,
    pub udp_buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            udp_idle_timeout_secs: DEFAULT_UDP_IDLE_TIMEOUT.as_secs(),
            udp_reap_interval_secs: DEFAULT_UDP_REAP_INTERVAL.as_secs(),
            dial_timeout_ms: DEFAULT_DIAL_TIMEOUT.as_millis() as u64,
            udp_buffer_size: DEFAULT_UDP_BUFFER_SIZE,
        }
    }
}

/// One `[proxy.<name>]` table, as written in the file.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub from: u16,
    pub to: u16,
    pub mode: String,
}

/// Validated, immutable description of one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySpec {
    pub name: String,
    pub from_port: u16,
    pub to_port: u16,
    pub mode: Transport,
}

impl ProxySpec {
    pub fn new(name: impl Into<String>, from_port: u16, to_port: u16, mode: Transport) -> Self {
        Self {
            name: name.into(),
            from_port,
            to_port,
            mode,
        }
    }

    /// The local service this relay forwards into.
    pub fn backend_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.to_port)
    }
}

/// Runtime settings shared by every relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    pub udp_idle_timeout: Duration,
    pub udp_reap_interval: Duration,
    pub dial_timeout: Duration,
    pub udp_buffer_size: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            udp_idle_timeout: DEFAULT_UDP_IDLE_TIMEOUT,
            udp_reap_interval: DEFAULT_UDP_REAP_INTERVAL,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            udp_buffer_size: DEFAULT_UDP_BUFFER_SIZE,
        }
    }
}

impl TryFrom<&RelayConfig> for RelaySettings {
    type Error = RelayError;

    fn try_from(cfg: &RelayConfig) -> Result<Self, Self::Error> {
        if cfg.udp_idle_timeout_secs == 0 {
            return Err(RelayError::InvalidConfig(
                "relay.udp_idle_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if cfg.udp_reap_interval_secs == 0 {
            return Err(RelayError::InvalidConfig(
                "relay.udp_reap_interval_secs must be greater than zero".to_string(),
            ));
        }
        if cfg.dial_timeout_ms == 0 {
            return Err(RelayError::InvalidConfig(
                "relay.dial_timeout_ms must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            udp_idle_timeout: Duration::from_secs(cfg.udp_idle_timeout_secs),
            udp_reap_interval: Duration::from_secs(cfg.udp_reap_interval_secs),
            dial_timeout: Duration::from_millis(cfg.dial_timeout_ms),
            udp_buffer_size: cfg
                .udp_buffer_size
                .clamp(MIN_UDP_BUFFER_SIZE, DEFAULT_UDP_BUFFER_SIZE),
        })
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, RelayError> {
        let contents = std::fs::read_to_string(path).map_err(|source| RelayError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&contents).map_err(|source| {
            RelayError::ConfigParse {
                path: path.to_path_buf(),
                source,
            }
        })?;

        if let Ok(level) = std::env::var("BULXY_LOG_LEVEL") {
            config.log_level = level;
        }

        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn settings(&self) -> Result<RelaySettings, RelayError> {
        RelaySettings::try_from(&self.relay)
    }

    /// Proxy entries in name order.
    pub fn proxy_entries(&self) -> Vec<(String, ProxyConfig)> {
        self.proxy
            .iter()
            .map(|(name, cfg)| (name.clone(), cfg.clone()))
            .collect()
    }

    /// Validate every proxy entry, in name order.
    pub fn proxy_specs(&self) -> Result<Vec<ProxySpec>, RelayError> {
        validate_entries(&self.proxy_entries())
    }
}

/// Convert raw entries into specs.
///
/// Fails on the first unknown mode or on a repeated `(mode, from)` pair. TCP and
/// UDP relays may share a port number.
pub fn validate_entries(entries: &[(String, ProxyConfig)]) -> Result<Vec<ProxySpec>, RelayError> {
    let mut seen = HashSet::new();
    let mut specs = Vec::with_capacity(entries.len());

    for (name, cfg) in entries {
        let mode: Transport = cfg.mode.parse()?;
        // Port 0 asks for an ephemeral port and never collides.
        if cfg.from != 0 && !seen.insert((mode, cfg.from)) {
            return Err(RelayError::DuplicateListener {
                transport: mode,
                port: cfg.from,
            });
        }
        specs.push(ProxySpec::new(name.clone(), cfg.from, cfg.to, mode));
    }

    Ok(specs)
}

fn default_hostname() -> String {
    "bulxy".to_string()
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
