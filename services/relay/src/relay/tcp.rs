//! TCP relay.
//!
//! One accept loop per relay; each accepted connection gets its own task that
//! dials the backend on loopback and copies bytes in both directions. The
//! first direction to finish (EOF or error) ends the connection: both sockets
//! are dropped, which unblocks the other direction.
//!
//! There is no limit on concurrent connections and no timeout on relayed
//! reads or writes. Only the backend dial is bounded.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument, Span};

use super::cancelled;
use super::stats::{TcpRelayStats, TcpStatsSnapshot};
use crate::config::{ProxySpec, RelaySettings};
use crate::error::{RelayError, RelayExit};
use crate::provider::{ListenerProvider, Transport};

/// Copy buffer size per direction.
const COPY_BUFFER_SIZE: usize = 8192;

/// Shared state for connection handlers.
struct ConnContext {
    backend_addr: SocketAddr,
    dial_timeout: Duration,
    stats: Arc<TcpRelayStats>,
}

/// A running TCP relay.
pub struct TcpRelay {
    spec: ProxySpec,
    local_addr: SocketAddr,
    stats: Arc<TcpRelayStats>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<RelayExit>,
    span: Span,
}

impl TcpRelay {
    /// Bind `spec.from_port` through the provider and start accepting.
    pub async fn start(
        spec: ProxySpec,
        provider: &dyn ListenerProvider,
        settings: &RelaySettings,
        span: Span,
    ) -> Result<Self, RelayError> {
        let listener = provider.listen_tcp(spec.from_port).await?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| RelayError::Listen {
                transport: Transport::Tcp,
                port: spec.from_port,
                source,
            })?;

        Ok(Self::spawn(spec, listener, local_addr, settings, span))
    }

    /// Start the accept loop on an already-bound connection source.
    fn spawn<A: Accept + 'static>(
        spec: ProxySpec,
        listener: A,
        local_addr: SocketAddr,
        settings: &RelaySettings,
        span: Span,
    ) -> Self {
        let stats = Arc::new(TcpRelayStats::default());
        let ctx = Arc::new(ConnContext {
            backend_addr: spec.backend_addr(),
            dial_timeout: settings.dial_timeout,
            stats: Arc::clone(&stats),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task =
            tokio::spawn(accept_loop(listener, ctx, shutdown_rx).instrument(span.clone()));

        info!(
            parent: &span,
            local_addr = %local_addr,
            backend_addr = %spec.backend_addr(),
            "TCP relay started"
        );

        Self {
            spec,
            local_addr,
            stats,
            shutdown_tx,
            accept_task,
            span,
        }
    }

    pub fn spec(&self) -> &ProxySpec {
        &self.spec
    }

    /// Address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> TcpStatsSnapshot {
        self.stats.snapshot()
    }

    /// Live counters, still readable after `stop` consumes the relay.
    pub fn stats_handle(&self) -> Arc<TcpRelayStats> {
        Arc::clone(&self.stats)
    }

    /// Number of connection handlers still running.
    pub fn active_connections(&self) -> u64 {
        self.stats.connections_active.load(Ordering::Acquire)
    }

    /// Stop accepting, close every relayed connection and wait for all
    /// handlers to finish.
    pub async fn stop(self) -> RelayExit {
        let Self {
            stats,
            shutdown_tx,
            accept_task,
            span,
            ..
        } = self;
        let _ = shutdown_tx.send(true);

        let exit = match accept_task.await {
            Ok(exit) => exit,
            Err(e) => RelayExit::ListenerFailed(io::Error::other(e)),
        };

        let stats = stats.snapshot();
        info!(
            parent: &span,
            connections_accepted = stats.connections_accepted,
            connections_active = stats.connections_active,
            bytes_to_backend = stats.bytes_to_backend,
            bytes_from_backend = stats.bytes_from_backend,
            "TCP relay stopped"
        );

        exit
    }
}

/// Where the accept loop takes inbound connections from.
#[async_trait]
trait Accept: Send + Sync {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Accept for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Accept until cancelled or the listener fails, then drain every handler.
async fn accept_loop<A: Accept>(
    listener: A,
    ctx: Arc<ConnContext>,
    mut shutdown: watch::Receiver<bool>,
) -> RelayExit {
    let mut handlers = JoinSet::new();

    let exit = loop {
        tokio::select! {
            biased;

            _ = cancelled(&mut shutdown) => {
                debug!("accept loop shutting down");
                break RelayExit::Stopped;
            }

            // Reap finished handlers so the set does not grow without bound.
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}

            accepted = Accept::accept(&listener) => match accepted {
                Ok((stream, peer_addr)) => {
                    ctx.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                    ctx.stats.connections_active.fetch_add(1, Ordering::AcqRel);

                    let guard = ActiveGuard(Arc::clone(&ctx.stats));
                    let ctx = Arc::clone(&ctx);
                    let shutdown = shutdown.clone();
                    handlers.spawn(
                        async move {
                            let _guard = guard;
                            handle_connection(stream, &ctx, shutdown).await;
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    if *shutdown.borrow() {
                        break RelayExit::Stopped;
                    }
                    error!(error = %e, "accept failed, relay no longer accepting");
                    break RelayExit::ListenerFailed(e);
                }
            },
        }
    };

    // Closing the listener refuses new connections while handlers drain.
    drop(listener);

    while handlers.join_next().await.is_some() {}

    exit
}

/// Decrements the active-connection count when a handler ends, however it ends.
struct ActiveGuard(Arc<TcpRelayStats>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.connections_active.fetch_sub(1, Ordering::AcqRel);
        self.0.connections_closed.fetch_add(1, Ordering::Relaxed);
    }
}

async fn handle_connection(
    mut client: TcpStream,
    ctx: &ConnContext,
    mut shutdown: watch::Receiver<bool>,
) {
    let dial = tokio::select! {
        _ = cancelled(&mut shutdown) => return,
        dial = timeout(ctx.dial_timeout, TcpStream::connect(ctx.backend_addr)) => dial,
    };

    let mut backend = match dial {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            ctx.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
            warn!(backend_addr = %ctx.backend_addr, error = %e, "Backend dial failed, dropping connection");
            return;
        }
        Err(_) => {
            ctx.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
            warn!(backend_addr = %ctx.backend_addr, "Backend dial timed out, dropping connection");
            return;
        }
    };

    debug!(backend_addr = %ctx.backend_addr, "Connected to backend");

    let (mut client_read, mut client_write) = client.split();
    let (mut backend_read, mut backend_write) = backend.split();

    tokio::select! {
        result = pump(&mut client_read, &mut backend_write, |n| {
            ctx.stats.bytes_to_backend.fetch_add(n, Ordering::Relaxed);
        }) => log_direction_end("client", result),
        result = pump(&mut backend_read, &mut client_write, |n| {
            ctx.stats.bytes_from_backend.fetch_add(n, Ordering::Relaxed);
        }) => log_direction_end("backend", result),
        _ = cancelled(&mut shutdown) => debug!("Connection closed by relay shutdown"),
    }
}

fn log_direction_end(source: &'static str, result: io::Result<u64>) {
    match result {
        Ok(bytes) => debug!(source, bytes, "Connection closed"),
        Err(e) => debug!(source, error = %e, "Connection error"),
    }
}

/// Copy from `reader` to `writer` until EOF, reporting each chunk to `on_copy`.
async fn pump<R, W, F>(reader: &mut R, writer: &mut W, on_copy: F) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(u64),
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
        on_copy(n as u64);
    }
}
