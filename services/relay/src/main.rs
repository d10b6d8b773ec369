//! bulxy - overlay-network TCP/UDP relay.
//!
//! Reads the proxy table from a TOML file, starts one relay per entry and
//! runs until interrupted.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use bulxy_relay::config::DEFAULT_LOG_LEVEL;
use bulxy_relay::{logging, Config, LocalListenerProvider, LogFormat, RelayError, Supervisor};

/// Relay overlay-network ports to local services.
#[derive(Debug, Parser)]
#[command(name = "bulxy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, env = "BULXY_CONFIG", default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            // No config means no configured logger; report through the default one.
            let level =
                std::env::var("BULXY_LOG_LEVEL").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());
            logging::init(&level, LogFormat::default())?;
            exit_with(anyhow::Error::new(e).context("failed to load config"));
        }
    };

    logging::init(&config.log_level, config.log_format)?;

    info!(
        hostname = %config.hostname,
        bind_addr = %config.bind_addr,
        proxy_count = config.proxy.len(),
        "Starting bulxy relay"
    );

    if let Err(e) = run(config).await {
        exit_with(e);
    }

    Ok(())
}

/// Log `err` with its cause chain and exit 1.
fn exit_with(err: anyhow::Error) -> ! {
    let reason = err
        .downcast_ref::<RelayError>()
        .map_or("internal", RelayError::reason_code);
    error!(reason, error = %err, "bulxy failed");
    for cause in err.chain().skip(1) {
        error!(cause = %cause, "caused by");
    }
    std::process::exit(1);
}

async fn run(config: Config) -> Result<()> {
    let settings = config.settings()?;
    let provider = LocalListenerProvider::new(config.bind_addr);

    let entries = config.proxy_entries();

    let supervisor = Supervisor::start(&entries, &provider, &settings)
        .await
        .context("failed to start relays")?;

    wait_for_shutdown().await?;
    info!("Shutdown requested, stopping relays");

    supervisor.stop().await;
    info!("All relays stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for ctrl-c")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")
}
