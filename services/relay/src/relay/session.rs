//! UDP session table.
//!
//! Maps each client address to the session carrying its traffic. The table is
//! the only state touched by more than one task (receive loop, reply loops,
//! reaper, shutdown), so every access goes through a single mutex and no
//! `.await` happens while it is held.
//!
//! ## Session lifecycle
//!
//! ```text
//! absent -> created (first datagram) -> active (traffic refreshes last_active)
//!        -> expired (idle past timeout, reaped) -> closed
//! ```
//!
//! A session is either present in the table with a running reply loop, or it
//! does not exist.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Last-activity clock for one session.
///
/// Stored as milliseconds since the session was created so both directions can
/// refresh it without taking the table lock.
#[derive(Debug)]
pub struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(origin: Instant) -> Self {
        Self {
            origin,
            last_ms: AtomicU64::new(0),
        }
    }

    /// Record traffic now.
    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    pub fn touch_at(&self, now: Instant) {
        let ms = now.saturating_duration_since(self.origin).as_millis() as u64;
        self.last_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub fn last_active(&self) -> Instant {
        self.origin + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active())
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// One client's flow: its address and the dedicated socket to the backend.
pub struct Session {
    id: u64,
    client: SocketAddr,
    socket: Arc<UdpSocket>,
    activity: Arc<Activity>,
    close_tx: Option<oneshot::Sender<()>>,
    reply_task: Option<JoinHandle<()>>,
}

impl Session {
    pub fn new(id: u64, client: SocketAddr, socket: Arc<UdpSocket>, activity: Arc<Activity>) -> Self {
        Self {
            id,
            client,
            socket,
            activity,
            close_tx: None,
            reply_task: None,
        }
    }

    /// Attach the reply loop that owns the receiving side of the socket.
    pub fn with_reply_loop(mut self, close_tx: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        self.close_tx = Some(close_tx);
        self.reply_task = Some(task);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client(&self) -> SocketAddr {
        self.client
    }

    fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            socket: Arc::clone(&self.socket),
            activity: Arc::clone(&self.activity),
        }
    }

    /// Signal the reply loop to exit and wait for it. The backend socket is
    /// closed once the loop and this session have both dropped it.
    pub async fn close(mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.reply_task.take() {
            let _ = task.await;
        }
    }
}

/// What the receive loop needs to forward a datagram, usable after the table
/// lock is released.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: u64,
    pub socket: Arc<UdpSocket>,
    pub activity: Arc<Activity>,
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: u64,
    pub client: SocketAddr,
    /// Local address of the session's backend socket.
    pub backend_local_addr: Option<SocketAddr>,
    pub idle: Duration,
}

/// Sessions behind the table lock.
#[derive(Default)]
struct Sessions {
    live: HashMap<SocketAddr, Session>,
    /// Sessions whose reply loop took them out of `live` itself. The loop
    /// cannot join its own task, so whoever drains the table does.
    retired: Vec<Session>,
}

/// Client address -> session mapping, shared by all tasks of one UDP relay.
#[derive(Clone, Default)]
pub struct SessionTable {
    inner: Arc<Mutex<Sessions>>,
    next_id: Arc<AtomicU64>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lookup(&self, client: &SocketAddr) -> Option<SessionHandle> {
        self.inner.lock().await.live.get(client).map(Session::handle)
    }

    /// Insert a session for `client` unless one already exists.
    ///
    /// `build` receives the new session id and runs under the table lock, so a
    /// reply loop spawned inside it cannot observe the table before its own
    /// session is present. Returns the handle of whichever session ends up in
    /// the table.
    pub async fn insert_with<F>(&self, client: SocketAddr, build: F) -> SessionHandle
    where
        F: FnOnce(u64) -> Session,
    {
        let mut sessions = self.inner.lock().await;
        if let Some(existing) = sessions.live.get(&client) {
            return existing.handle();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = build(id);
        let handle = session.handle();
        sessions.live.insert(client, session);
        handle
    }

    /// Remove the session for `client` only if it is still session `id`.
    pub async fn remove_if(&self, client: &SocketAddr, id: u64) -> Option<Session> {
        let mut sessions = self.inner.lock().await;
        match sessions.live.get(client) {
            Some(session) if session.id == id => sessions.live.remove(client),
            _ => None,
        }
    }

    /// Like [`remove_if`](Self::remove_if), for a reply loop removing its own
    /// session: the session is kept aside until [`take_retired`](Self::take_retired)
    /// or [`drain`](Self::drain) hands it to a task that can join the loop.
    pub async fn retire_if(&self, client: &SocketAddr, id: u64) -> bool {
        let mut sessions = self.inner.lock().await;
        match sessions.live.get(client) {
            Some(session) if session.id == id => {
                if let Some(session) = sessions.live.remove(client) {
                    sessions.retired.push(session);
                }
                true
            }
            _ => false,
        }
    }

    pub async fn take_retired(&self) -> Vec<Session> {
        std::mem::take(&mut self.inner.lock().await.retired)
    }

    /// Remove every session idle for longer than `idle_timeout` as of `now`.
    ///
    /// The caller closes the returned sessions after the lock is released.
    pub async fn reap_idle(&self, now: Instant, idle_timeout: Duration) -> Vec<Session> {
        let mut sessions = self.inner.lock().await;
        let expired: Vec<SocketAddr> = sessions
            .live
            .iter()
            .filter(|(_, s)| s.activity.idle_for(now) > idle_timeout)
            .map(|(client, _)| *client)
            .collect();

        expired
            .iter()
            .filter_map(|client| sessions.live.remove(client))
            .collect()
    }

    /// Remove every session, retired ones included.
    pub async fn drain(&self) -> Vec<Session> {
        let mut sessions = self.inner.lock().await;
        let mut drained: Vec<Session> = sessions.live.drain().map(|(_, s)| s).collect();
        drained.append(&mut sessions.retired);
        drained
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.live.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.live.is_empty()
    }

    pub async fn contains(&self, client: &SocketAddr) -> bool {
        self.inner.lock().await.live.contains_key(client)
    }

    pub async fn snapshot(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        let sessions = self.inner.lock().await;
        let mut infos: Vec<SessionInfo> = sessions
            .live
            .values()
            .map(|s| SessionInfo {
                id: s.id,
                client: s.client,
                backend_local_addr: s.socket.local_addr().ok(),
                idle: s.activity.idle_for(now),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}
