//! Relay supervisor.
//!
//! Owns one relay per configured proxy entry. Startup is all-or-nothing:
//! entries are validated before any socket is bound, and if a relay fails to
//! bind, the relays already started are stopped before the error is returned.

use tracing::{error, info, warn};

use crate::config::{validate_entries, ProxyConfig, ProxySpec, RelaySettings};
use crate::error::RelayError;
use crate::provider::ListenerProvider;
use crate::relay::RelayHandle;

/// Running set of relays.
pub struct Supervisor {
    relays: Vec<RelayHandle>,
}

impl Supervisor {
    /// Validate raw proxy entries, then start them in order.
    pub async fn start(
        entries: &[(String, ProxyConfig)],
        provider: &dyn ListenerProvider,
        settings: &RelaySettings,
    ) -> Result<Self, RelayError> {
        let specs = validate_entries(entries)?;
        Self::start_specs(specs, provider, settings).await
    }

    /// Start already-validated specs in order.
    pub async fn start_specs(
        specs: Vec<ProxySpec>,
        provider: &dyn ListenerProvider,
        settings: &RelaySettings,
    ) -> Result<Self, RelayError> {
        let mut relays = Vec::with_capacity(specs.len());

        for spec in specs {
            let name = spec.name.clone();
            match RelayHandle::start(spec, provider, settings).await {
                Ok(relay) => relays.push(relay),
                Err(e) => {
                    error!(
                        proxy = %name,
                        reason = e.reason_code(),
                        error = %e,
                        "Relay failed to start, stopping started relays"
                    );
                    Self { relays }.stop().await;
                    return Err(e);
                }
            }
        }

        info!(relay_count = relays.len(), "All relays started");
        Ok(Self { relays })
    }

    pub fn relays(&self) -> &[RelayHandle] {
        &self.relays
    }

    /// Stop every relay concurrently and wait for all of them.
    pub async fn stop(self) {
        let stops = self.relays.into_iter().map(|relay| {
            let name = relay.spec().name.clone();
            tokio::spawn(async move { (name, relay.stop().await) })
        });

        for stop in stops.collect::<Vec<_>>() {
            match stop.await {
                Ok((name, exit)) if !exit.is_stopped() => {
                    warn!(proxy = %name, exit = ?exit, "Relay had already failed before stop");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Relay stop task failed"),
            }
        }
    }
}
