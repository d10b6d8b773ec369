//! UDP relay.
//!
//! All clients share one listening socket. Each distinct client address gets a
//! session: a dedicated socket connected to the backend on loopback, plus a
//! reply loop that sends whatever the backend returns back to that client
//! through the shared socket.
//!
//! ```text
//! client A ─┐                 ┌─ session A socket ─┐
//!           ├─ listen socket ─┤                    ├─ 127.0.0.1:to
//! client B ─┘                 └─ session B socket ─┘
//! ```
//!
//! UDP has no teardown signal, so sessions expire after a period with no
//! traffic in either direction. A reaper sweeps the table on a fixed interval.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument, Span};

use super::cancelled;
use super::session::{Activity, Session, SessionHandle, SessionTable};
use super::stats::{UdpRelayStats, UdpStatsSnapshot};
use crate::config::{ProxySpec, RelaySettings};
use crate::error::{RelayError, RelayExit};
use crate::provider::{ListenerProvider, Transport};

/// State shared by the receive loop, reply loops and reaper of one relay.
struct UdpContext {
    listener: Arc<UdpSocket>,
    backend_addr: SocketAddr,
    sessions: SessionTable,
    stats: Arc<UdpRelayStats>,
    buffer_size: usize,
    idle_timeout: Duration,
}

/// A running UDP relay.
pub struct UdpRelay {
    spec: ProxySpec,
    local_addr: SocketAddr,
    ctx: Arc<UdpContext>,
    shutdown_tx: watch::Sender<bool>,
    recv_task: JoinHandle<RelayExit>,
    reaper_task: JoinHandle<()>,
    span: Span,
}

impl UdpRelay {
    /// Bind `spec.from_port` through the provider and start relaying.
    pub async fn start(
        spec: ProxySpec,
        provider: &dyn ListenerProvider,
        settings: &RelaySettings,
        span: Span,
    ) -> Result<Self, RelayError> {
        let listener = Arc::new(provider.listen_udp(spec.from_port).await?);
        let local_addr = listener
            .local_addr()
            .map_err(|source| RelayError::Listen {
                transport: Transport::Udp,
                port: spec.from_port,
                source,
            })?;

        Ok(Self::spawn(
            spec,
            Arc::clone(&listener),
            listener,
            local_addr,
            settings,
            span,
        ))
    }

    /// Start the receive loop on `source` and the reaper. Replies go out
    /// through `listener`.
    fn spawn<R: RecvFrom + 'static>(
        spec: ProxySpec,
        listener: Arc<UdpSocket>,
        source: R,
        local_addr: SocketAddr,
        settings: &RelaySettings,
        span: Span,
    ) -> Self {
        let ctx = Arc::new(UdpContext {
            listener,
            backend_addr: spec.backend_addr(),
            sessions: SessionTable::new(),
            stats: Arc::new(UdpRelayStats::default()),
            buffer_size: settings.udp_buffer_size,
            idle_timeout: settings.udp_idle_timeout,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let recv_task = tokio::spawn(
            receive_loop(Arc::clone(&ctx), source, shutdown_rx.clone()).instrument(span.clone()),
        );
        let reaper_task = tokio::spawn(
            reaper_loop(Arc::clone(&ctx), settings.udp_reap_interval, shutdown_rx)
                .instrument(span.clone()),
        );

        info!(
            parent: &span,
            local_addr = %local_addr,
            backend_addr = %spec.backend_addr(),
            idle_timeout_secs = settings.udp_idle_timeout.as_secs(),
            "UDP relay started"
        );

        Self {
            spec,
            local_addr,
            ctx,
            shutdown_tx,
            recv_task,
            reaper_task,
            span,
        }
    }

    pub fn spec(&self) -> &ProxySpec {
        &self.spec
    }

    /// Address the listening socket is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> UdpStatsSnapshot {
        self.ctx.stats.snapshot()
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.ctx.sessions
    }

    /// Run one reaper pass as of `now`. Returns the number of sessions expired.
    pub async fn reap_now(&self, now: Instant) -> usize {
        reap_idle_sessions(&self.ctx, now).await
    }

    /// Stop receiving, close every session and wait for all reply loops.
    pub async fn stop(self) -> RelayExit {
        let Self {
            ctx,
            shutdown_tx,
            recv_task,
            reaper_task,
            span,
            ..
        } = self;
        let _ = shutdown_tx.send(true);

        let exit = match recv_task.await {
            Ok(exit) => exit,
            Err(e) => RelayExit::ListenerFailed(io::Error::other(e)),
        };
        let _ = reaper_task.await;

        let sessions = ctx.sessions.drain().await;
        let sessions_closed = sessions.len();
        for session in sessions {
            session.close().await;
        }

        let stats = ctx.stats.snapshot();
        info!(
            parent: &span,
            sessions_closed,
            sessions_created = stats.sessions_created,
            datagrams_to_backend = stats.datagrams_to_backend,
            datagrams_to_client = stats.datagrams_to_client,
            "UDP relay stopped"
        );

        exit
    }
}

/// Where the receive loop reads client datagrams from.
#[async_trait]
trait RecvFrom: Send + Sync {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

#[async_trait]
impl RecvFrom for Arc<UdpSocket> {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }
}

async fn receive_loop<R: RecvFrom>(
    ctx: Arc<UdpContext>,
    source: R,
    mut shutdown: watch::Receiver<bool>,
) -> RelayExit {
    let mut buf = vec![0u8; ctx.buffer_size];

    loop {
        let (n, client) = tokio::select! {
            biased;

            _ = cancelled(&mut shutdown) => {
                debug!("receive loop shutting down");
                return RelayExit::Stopped;
            }

            received = source.recv_from(&mut buf) => match received {
                Ok(received) => received,
                // ICMP unreachable reported on the shared socket (Windows) is
                // about one client, not the listener.
                Err(e) if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                ) => {
                    debug!(error = %e, "ignoring per-peer error on listening socket");
                    continue;
                }
                Err(e) => {
                    if *shutdown.borrow() {
                        return RelayExit::Stopped;
                    }
                    error!(error = %e, "receive failed, relay no longer serving");
                    return RelayExit::ListenerFailed(e);
                }
            },
        };

        forward_to_backend(&ctx, client, &buf[..n]).await;
    }
}

async fn forward_to_backend(ctx: &Arc<UdpContext>, client: SocketAddr, payload: &[u8]) {
    let session = match ctx.sessions.lookup(&client).await {
        Some(session) => session,
        None => match open_session(ctx, client).await {
            Some(session) => session,
            None => {
                ctx.stats.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        },
    };

    match session.socket.send(payload).await {
        Ok(_) => {
            session.activity.touch();
            ctx.stats.datagrams_to_backend.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            ctx.stats.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(client = %client, error = %e, "Write to backend failed, closing session");
            if let Some(session) = ctx.sessions.remove_if(&client, session.id).await {
                session.close().await;
            }
        }
    }
}

/// Dial the backend for a new client and register the session.
///
/// On dial failure nothing is inserted, so the client's next datagram retries.
async fn open_session(ctx: &Arc<UdpContext>, client: SocketAddr) -> Option<SessionHandle> {
    let socket = match dial_backend(ctx.backend_addr).await {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            ctx.stats.session_dial_failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                client = %client,
                backend_addr = %ctx.backend_addr,
                error = %e,
                "Session dial failed, dropping datagram"
            );
            return None;
        }
    };

    let handle = ctx
        .sessions
        .insert_with(client, |id| {
            let activity = Arc::new(Activity::new());
            let (close_tx, close_rx) = oneshot::channel();
            let task = tokio::spawn(
                reply_loop(
                    Arc::clone(ctx),
                    id,
                    client,
                    Arc::clone(&socket),
                    Arc::clone(&activity),
                    close_rx,
                )
                .instrument(tracing::debug_span!("session", client = %client, id)),
            );
            Session::new(id, client, Arc::clone(&socket), activity).with_reply_loop(close_tx, task)
        })
        .await;

    ctx.stats.sessions_created.fetch_add(1, Ordering::Relaxed);
    debug!(
        client = %client,
        session_id = handle.id,
        backend_local_addr = ?socket.local_addr().ok(),
        "Session created"
    );

    Some(handle)
}

async fn dial_backend(backend_addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await?;
    socket.connect(backend_addr).await?;
    Ok(socket)
}

/// Relay backend replies to `client` until the session is closed or the
/// backend socket fails.
async fn reply_loop(
    ctx: Arc<UdpContext>,
    id: u64,
    client: SocketAddr,
    socket: Arc<UdpSocket>,
    activity: Arc<Activity>,
    mut close_rx: oneshot::Receiver<()>,
) {
    let mut buf = vec![0u8; ctx.buffer_size];

    loop {
        tokio::select! {
            biased;

            _ = &mut close_rx => {
                debug!("Session closed");
                return;
            }

            received = socket.recv(&mut buf) => match received {
                Ok(n) => {
                    if let Err(e) = ctx.listener.send_to(&buf[..n], client).await {
                        debug!(error = %e, "Write to client failed, closing session");
                        break;
                    }
                    activity.touch();
                    ctx.stats.datagrams_to_client.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    debug!(error = %e, "Backend read failed, closing session");
                    break;
                }
            },
        }
    }

    // Failed on our own: take the session out of the table, unless it was
    // already replaced or removed. The reaper or stop joins this task.
    if ctx.sessions.retire_if(&client, id).await {
        debug!("Session removed after backend failure");
    }
}

async fn reaper_loop(ctx: Arc<UdpContext>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = cancelled(&mut shutdown) => return,

            _ = ticker.tick() => {
                reap_idle_sessions(&ctx, Instant::now()).await;
            }
        }
    }
}

async fn reap_idle_sessions(ctx: &UdpContext, now: Instant) -> usize {
    let expired = ctx.sessions.reap_idle(now, ctx.idle_timeout).await;
    let count = expired.len();
    ctx.stats
        .sessions_expired
        .fetch_add(count as u64, Ordering::Relaxed);

    for session in expired {
        debug!(
            client = %session.client(),
            session_id = session.id(),
            "Session expired"
        );
        session.close().await;
    }

    for session in ctx.sessions.take_retired().await {
        session.close().await;
    }

    count
}
