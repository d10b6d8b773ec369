//! Per-relay counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for a TCP relay.
#[derive(Debug, Default)]
pub struct TcpRelayStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connection handlers currently running.
    pub connections_active: AtomicU64,
    /// Connection handlers that have finished.
    pub connections_closed: AtomicU64,
    /// Backend dials that failed or timed out.
    pub backend_failed: AtomicU64,
    /// Bytes copied client -> backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes copied backend -> client.
    pub bytes_from_backend: AtomicU64,
}

/// Point-in-time copy of [`TcpRelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_closed: u64,
    pub backend_failed: u64,
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
}

impl TcpRelayStats {
    pub fn snapshot(&self) -> TcpStatsSnapshot {
        TcpStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            backend_failed: self.backend_failed.load(Ordering::Relaxed),
            bytes_to_backend: self.bytes_to_backend.load(Ordering::Relaxed),
            bytes_from_backend: self.bytes_from_backend.load(Ordering::Relaxed),
        }
    }
}

/// Counters for a UDP relay.
#[derive(Debug, Default)]
pub struct UdpRelayStats {
    pub sessions_created: AtomicU64,
    /// Sessions removed by the idle reaper.
    pub sessions_expired: AtomicU64,
    pub session_dial_failed: AtomicU64,
    pub datagrams_to_backend: AtomicU64,
    pub datagrams_to_client: AtomicU64,
    /// Datagrams lost to dial or write failures.
    pub datagrams_dropped: AtomicU64,
}

/// Point-in-time copy of [`UdpRelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UdpStatsSnapshot {
    pub sessions_created: u64,
    pub sessions_expired: u64,
    pub session_dial_failed: u64,
    pub datagrams_to_backend: u64,
    pub datagrams_to_client: u64,
    pub datagrams_dropped: u64,
}

impl UdpRelayStats {
    pub fn snapshot(&self) -> UdpStatsSnapshot {
        UdpStatsSnapshot {
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_expired: self.sessions_expired.load(Ordering::Relaxed),
            session_dial_failed: self.session_dial_failed.load(Ordering::Relaxed),
            datagrams_to_backend: self.datagrams_to_backend.load(Ordering::Relaxed),
            datagrams_to_client: self.datagrams_to_client.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
        }
    }
}
