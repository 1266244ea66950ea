//! One tunnel session: an accepted vsock connection paired with the tun
//! device, forwarded in both directions until either side fails.
//!
//! ```text
//! Starting -> Running -> Draining -> Closed
//! ```
//!
//! The first pump to stop moves the session to `Draining`. The session then
//! fires its close signal, which makes every blocked read or write of the
//! other pump return, and waits for that pump before reporting `Closed`.

use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::iface::PacketInterface;
use crate::pump::{self, Direction, PumpError, PumpErrorKind};
use crate::stats::TunnelStats;

/// Lifecycle of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Draining,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owner side of a session's close signal.
pub struct Closer {
    tx: watch::Sender<bool>,
}

impl Closer {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// A new receiver for this closer.
    pub fn signal(&self) -> CloseSignal {
        CloseSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Close the session. Calling this more than once has no further effect.
    pub fn close(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for Closer {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver side of a session's close signal.
#[derive(Clone)]
pub struct CloseSignal {
    rx: watch::Receiver<bool>,
}

impl CloseSignal {
    /// Resolves once the session is closed or its [`Closer`] is gone.
    pub async fn closed(&mut self) {
        let _ = self.rx.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Outcome of a finished session.
#[derive(Debug)]
pub struct SessionReport {
    pub id: u64,
    pub peer: String,
    /// Terminal error of the pump that stopped first.
    pub first: PumpError,
    /// Terminal error of the pump stopped during draining.
    pub second: PumpError,
    pub state: SessionState,
}

/// A single tunnel session.
///
/// Owns the connection exclusively; the interface is shared with later
/// sessions but never with a concurrent one.
pub struct Session<C, I: ?Sized> {
    id: u64,
    peer: String,
    conn: C,
    iface: Arc<I>,
    stats: Arc<TunnelStats>,
}

impl<C, I> Session<C, I>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    I: PacketInterface + ?Sized + 'static,
{
    pub fn new(id: u64, peer: String, conn: C, iface: Arc<I>, stats: Arc<TunnelStats>) -> Self {
        Self {
            id,
            peer,
            conn,
            iface,
            stats,
        }
    }

    /// Forward packets in both directions until the session is closed.
    ///
    /// Returns only after both pumps have stopped; the connection is dropped
    /// before returning.
    pub async fn run(self) -> SessionReport {
        let Session {
            id,
            peer,
            conn,
            iface,
            stats,
        } = self;
        let mut state = SessionState::Starting;

        let (sock_rx, sock_tx) = tokio::io::split(conn);
        let closer = Closer::new();

        let mut outbound = tokio::spawn({
            let iface = Arc::clone(&iface);
            let stats = Arc::clone(&stats);
            let close = closer.signal();
            async move {
                pump::tun_to_vsock(
                    iface.as_ref(),
                    sock_tx,
                    close,
                    stats.direction(Direction::TunToVsock),
                )
                .await
            }
        });
        let mut inbound = tokio::spawn({
            let iface = Arc::clone(&iface);
            let stats = Arc::clone(&stats);
            let close = closer.signal();
            async move {
                pump::vsock_to_tun(
                    sock_rx,
                    iface.as_ref(),
                    close,
                    stats.direction(Direction::VsockToTun),
                )
                .await
            }
        });
        transition(id, &mut state, SessionState::Running);

        let (first, remaining) = tokio::select! {
            r = &mut outbound => (joined(Direction::TunToVsock, r), inbound),
            r = &mut inbound => (joined(Direction::VsockToTun, r), outbound),
        };
        transition(id, &mut state, SessionState::Draining);
        log_pump_exit(id, &first);

        closer.close();
        let second = joined(first.direction.opposite(), remaining.await);
        log_pump_exit(id, &second);
        transition(id, &mut state, SessionState::Closed);

        info!(session = id, peer = %peer, "Session closed");
        SessionReport {
            id,
            peer,
            first,
            second,
            state,
        }
    }
}

fn transition(id: u64, state: &mut SessionState, next: SessionState) {
    debug!(session = id, from = %state, to = %next, "Session state change");
    *state = next;
}

fn joined(direction: Direction, result: Result<PumpError, JoinError>) -> PumpError {
    result.unwrap_or_else(|e| PumpError::new(direction, PumpErrorKind::Aborted(e.to_string())))
}

fn log_pump_exit(id: u64, err: &PumpError) {
    if err.is_eof() || err.is_closed() {
        info!(session = id, "{err}");
    } else {
        warn!(session = id, "{err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;
    use crate::test_util::MemoryInterface;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_closer_wakes_all_signals() {
        let closer = Closer::new();
        let mut a = closer.signal();
        let mut b = closer.signal();
        assert!(!a.is_closed());

        closer.close();
        closer.close();
        timeout(WAIT, a.closed()).await.unwrap();
        timeout(WAIT, b.closed()).await.unwrap();
        assert!(b.is_closed());
    }

    #[tokio::test]
    async fn test_dropped_closer_counts_as_closed() {
        let closer = Closer::new();
        let mut signal = closer.signal();
        drop(closer);
        timeout(WAIT, signal.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_eof_closes_both_directions() {
        let (iface, _handle) = MemoryInterface::new();
        let (client, server) = tokio::io::duplex(1024);
        let stats = Arc::new(TunnelStats::new());
        let session = Session::new(1, "test".into(), server, Arc::new(iface), stats);

        let task = tokio::spawn(session.run());
        drop(client);

        let report = timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(report.state, SessionState::Closed);
        assert_eq!(report.first.direction, Direction::VsockToTun);
        assert!(report.first.is_eof());
        assert_eq!(report.second.direction, Direction::TunToVsock);
    }

    #[tokio::test]
    async fn test_interface_failure_closes_session() {
        let (iface, handle) = MemoryInterface::new();
        let (mut client, server) = tokio::io::duplex(1024);
        let stats = Arc::new(TunnelStats::new());
        let session = Session::new(7, "test".into(), server, Arc::new(iface), stats);

        let task = tokio::spawn(session.run());
        drop(handle);

        // The tun side went away: the peer sees end-of-stream.
        let mut rest = Vec::new();
        timeout(WAIT, client.read_to_end(&mut rest)).await.unwrap().unwrap();
        assert!(rest.is_empty());

        let report = timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(report.id, 7);
        assert_eq!(report.first.direction, Direction::TunToVsock);
        assert!(matches!(report.first.kind, PumpErrorKind::InterfaceRead(_)));
    }

    #[tokio::test]
    async fn test_truncated_frame_ends_session() {
        let (iface, mut handle) = MemoryInterface::new();
        let (mut client, server) = tokio::io::duplex(1024);
        let stats = Arc::new(TunnelStats::new());
        let session = Session::new(1, "test".into(), server, Arc::new(iface), Arc::clone(&stats));

        let task = tokio::spawn(session.run());
        client.write_all(&frame::encode(b"whole").unwrap()).await.unwrap();
        // Announce 100 bytes, deliver 3, then hang up.
        client.write_all(&[0x00, 0x64, 1, 2, 3]).await.unwrap();
        drop(client);

        let report = timeout(WAIT, task).await.unwrap().unwrap();
        assert!(matches!(report.first.kind, PumpErrorKind::SocketRead(_)));
        assert_eq!(handle.next_sent().await.unwrap(), b"whole");
        assert!(handle.try_next_sent().is_none());
        assert_eq!(stats.snapshot().vsock_to_tun.packets, 1);
    }
}
