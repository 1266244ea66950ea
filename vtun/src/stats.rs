//! Tunnel counters exposed by the diagnostic endpoint.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::pump::Direction;

/// Packet and byte counters for one forwarding direction.
#[derive(Default)]
pub struct DirectionStats {
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl DirectionStats {
    pub fn record(&self, bytes: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> DirectionSnapshot {
        DirectionSnapshot {
            packets: self.packets(),
            bytes: self.bytes(),
        }
    }
}

/// Process-wide tunnel counters, shared between the engine, its sessions
/// and the diagnostic endpoint.
#[derive(Default)]
pub struct TunnelStats {
    next_session_id: AtomicU64,
    sessions_accepted: AtomicU64,
    sessions_closed: AtomicU64,
    accept_errors: AtomicU64,
    session_active: AtomicBool,
    tun_to_vsock: DirectionStats,
    vsock_to_tun: DirectionStats,
}

impl TunnelStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly accepted connection and return its session id.
    pub fn session_opened(&self) -> u64 {
        self.sessions_accepted.fetch_add(1, Ordering::Relaxed);
        self.session_active.store(true, Ordering::Relaxed);
        self.next_session_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
        self.session_active.store(false, Ordering::Relaxed);
    }

    pub fn accept_failed(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn direction(&self, direction: Direction) -> &DirectionStats {
        match direction {
            Direction::TunToVsock => &self.tun_to_vsock,
            Direction::VsockToTun => &self.vsock_to_tun,
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sessions_accepted: self.sessions_accepted.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            session_active: self.session_active.load(Ordering::Relaxed),
            tun_to_vsock: self.tun_to_vsock.snapshot(),
            vsock_to_tun: self.vsock_to_tun.snapshot(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectionSnapshot {
    pub packets: u64,
    pub bytes: u64,
}

/// Point-in-time copy of [`TunnelStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub sessions_accepted: u64,
    pub sessions_closed: u64,
    pub accept_errors: u64,
    pub session_active: bool,
    pub tun_to_vsock: DirectionSnapshot,
    pub vsock_to_tun: DirectionSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_sequential() {
        let stats = TunnelStats::new();
        assert_eq!(stats.session_opened(), 1);
        stats.session_closed();
        assert_eq!(stats.session_opened(), 2);

        let snap = stats.snapshot();
        assert_eq!(snap.sessions_accepted, 2);
        assert_eq!(snap.sessions_closed, 1);
        assert!(snap.session_active);
    }

    #[test]
    fn test_direction_counters() {
        let stats = TunnelStats::new();
        stats.direction(Direction::TunToVsock).record(100);
        stats.direction(Direction::TunToVsock).record(0);
        stats.direction(Direction::VsockToTun).record(42);

        let snap = stats.snapshot();
        assert_eq!(snap.tun_to_vsock, DirectionSnapshot { packets: 2, bytes: 100 });
        assert_eq!(snap.vsock_to_tun, DirectionSnapshot { packets: 1, bytes: 42 });
    }
}
