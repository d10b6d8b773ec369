//! Error types for the relay service.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::provider::Transport;

/// Errors that escape a relay's own tasks.
///
/// Per-connection and per-session failures (backend dial, mid-flight reads and
/// writes) are handled inside the task that owns the connection and never
/// surface here.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The listener provider could not bind the requested port.
    #[error("listen failed: {transport} port {port}: {source}")]
    Listen {
        transport: Transport,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// A proxy entry names a mode other than `tcp` or `udp`.
    #[error("unknown proxy mode: {0:?}")]
    UnknownMode(String),

    /// Two proxy entries listen on the same port with the same transport.
    #[error("duplicate listener: {transport} port {port} is configured more than once")]
    DuplicateListener { transport: Transport, port: u16 },

    /// A configuration value is out of range.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The configuration file could not be read.
    #[error("failed to read config {}: {source}", .path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The configuration file is not valid TOML for the expected schema.
    #[error("failed to parse config {}: {source}", .path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl RelayError {
    /// Stable reason code, emitted as a structured log field.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RelayError::Listen { .. } => "listen_failed",
            RelayError::UnknownMode(_) => "unknown_mode",
            RelayError::DuplicateListener { .. } => "duplicate_listener",
            RelayError::InvalidConfig(_) => "invalid_config",
            RelayError::ConfigRead { .. } => "config_read_failed",
            RelayError::ConfigParse { .. } => "config_parse_failed",
        }
    }

    /// Whether this error was raised before any relay could be created.
    pub fn is_configuration(&self) -> bool {
        !matches!(self, RelayError::Listen { .. })
    }
}

/// How a relay's listening loop ended.
#[derive(Debug)]
pub enum RelayExit {
    /// The relay observed its cancellation signal.
    Stopped,
    /// The listening socket itself failed; the relay stopped serving.
    ListenerFailed(io::Error),
}

impl RelayExit {
    pub fn is_stopped(&self) -> bool {
        matches!(self, RelayExit::Stopped)
    }
}
