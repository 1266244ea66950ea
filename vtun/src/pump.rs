//! Single-direction forwarding loops between the tun device and the vsock
//! connection.
//!
//! A pump runs until its first read error, write error or end-of-stream and
//! then reports exactly one terminal [`PumpError`]. It never retries; the
//! session decides what happens next.

use std::fmt;
use std::future::Future;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::frame::{FrameBuffer, FrameError};
use crate::iface::PacketInterface;
use crate::session::CloseSignal;
use crate::stats::DirectionStats;

/// Direction of travel of a pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    TunToVsock,
    VsockToTun,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::TunToVsock => "tun-to-vsock",
            Direction::VsockToTun => "vsock-to-tun",
        }
    }

    pub fn opposite(&self) -> Direction {
        match self {
            Direction::TunToVsock => Direction::VsockToTun,
            Direction::VsockToTun => Direction::TunToVsock,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a pump stopped.
#[derive(Debug, Error)]
pub enum PumpErrorKind {
    #[error("tun read failed: {0}")]
    InterfaceRead(#[source] io::Error),

    #[error("tun write failed: {0}")]
    InterfaceWrite(#[source] io::Error),

    #[error("vsock read failed: {0}")]
    SocketRead(#[source] FrameError),

    #[error("vsock write failed: {0}")]
    SocketWrite(#[source] io::Error),

    #[error("framing failed: {0}")]
    Encode(#[source] FrameError),

    #[error("session closed")]
    Closed,

    #[error("worker aborted: {0}")]
    Aborted(String),
}

/// Terminal condition of a pump, tagged with its direction.
#[derive(Debug, Error)]
#[error("stopped {direction} forwarding because: {kind}")]
pub struct PumpError {
    pub direction: Direction,
    #[source]
    pub kind: PumpErrorKind,
}

impl PumpError {
    pub fn new(direction: Direction, kind: PumpErrorKind) -> Self {
        Self { direction, kind }
    }

    /// True if the pump stopped on a clean end-of-stream from the peer.
    pub fn is_eof(&self) -> bool {
        match &self.kind {
            PumpErrorKind::SocketRead(e) => e.is_eof(),
            PumpErrorKind::InterfaceRead(e) => e.kind() == io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }

    /// True if the pump was stopped by the session rather than by a failure
    /// of its own.
    pub fn is_closed(&self) -> bool {
        matches!(self.kind, PumpErrorKind::Closed)
    }
}

/// Run `op` unless the session gets closed first.
async fn guarded<T>(close: &mut CloseSignal, op: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        _ = close.closed() => None,
        r = op => Some(r),
    }
}

/// Forward packets read from the tun device to the vsock connection.
///
/// Each packet is prefixed with its length. When the loop ends the write side
/// of the connection is shut down so the peer, and the opposite pump reading
/// from the same connection, observe the end of the session.
pub async fn tun_to_vsock<I, W>(
    iface: &I,
    mut to: W,
    mut close: CloseSignal,
    stats: &DirectionStats,
) -> PumpError
where
    I: PacketInterface + ?Sized,
    W: AsyncWrite + Unpin,
{
    let mut buf = FrameBuffer::new();

    let kind = loop {
        let n = match guarded(&mut close, iface.recv(buf.payload_mut())).await {
            None => break PumpErrorKind::Closed,
            Some(Err(e)) => break PumpErrorKind::InterfaceRead(e),
            // An empty read carries no packet and is not end-of-stream.
            Some(Ok(0)) => continue,
            Some(Ok(n)) => n,
        };

        let frame = match buf.seal(n) {
            Ok(frame) => frame,
            Err(e) => break PumpErrorKind::Encode(e),
        };

        let written = guarded(&mut close, async {
            to.write_all(frame).await?;
            to.flush().await
        })
        .await;
        match written {
            None => break PumpErrorKind::Closed,
            Some(Err(e)) => break PumpErrorKind::SocketWrite(e),
            Some(Ok(())) => {}
        }

        trace!(len = n, "forwarded packet to vsock");
        stats.record(n);
    };

    let _ = to.shutdown().await;
    PumpError::new(Direction::TunToVsock, kind)
}

/// Forward length-prefixed packets read from the vsock connection to the tun
/// device.
pub async fn vsock_to_tun<R, I>(
    mut from: R,
    iface: &I,
    mut close: CloseSignal,
    stats: &DirectionStats,
) -> PumpError
where
    R: AsyncRead + Unpin,
    I: PacketInterface + ?Sized,
{
    let mut buf = FrameBuffer::new();

    let kind = loop {
        let packet = match guarded(&mut close, buf.read_from(&mut from)).await {
            None => break PumpErrorKind::Closed,
            Some(Err(e)) => break PumpErrorKind::SocketRead(e),
            Some(Ok(packet)) => packet,
        };

        match guarded(&mut close, iface.send(packet)).await {
            None => break PumpErrorKind::Closed,
            Some(Err(e)) => break PumpErrorKind::InterfaceWrite(e),
            Some(Ok(_)) => {}
        }

        trace!(len = packet.len(), "forwarded packet to tun");
        stats.record(packet.len());
    };

    PumpError::new(Direction::VsockToTun, kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;
    use crate::session::Closer;
    use crate::test_util::MemoryInterface;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_tun_to_vsock_shuts_down_write_side() {
        let (iface, handle) = MemoryInterface::new();
        let (mut client, server) = tokio::io::duplex(256);
        let closer = Closer::new();
        let stats = DirectionStats::default();

        handle.inject(b"one".to_vec());
        drop(handle);

        let err = timeout(
            WAIT,
            tun_to_vsock(&iface, server, closer.signal(), &stats),
        )
        .await
        .unwrap();
        assert_eq!(err.direction, Direction::TunToVsock);
        assert!(matches!(err.kind, PumpErrorKind::InterfaceRead(_)));

        // The queued packet went out before the failure, then end-of-stream.
        let mut wire = Vec::new();
        client.read_to_end(&mut wire).await.unwrap();
        assert_eq!(wire, frame::encode(b"one").unwrap());
        assert_eq!(stats.packets(), 1);
        assert_eq!(stats.bytes(), 3);
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_reads() {
        let (iface, _handle) = MemoryInterface::new();
        let (_client, server) = tokio::io::duplex(256);
        let (server_rx, server_tx) = tokio::io::split(server);
        let closer = Closer::new();
        let stats = DirectionStats::default();

        let outbound = tun_to_vsock(&iface, server_tx, closer.signal(), &stats);
        let inbound = vsock_to_tun(server_rx, &iface, closer.signal(), &stats);
        closer.close();

        let (a, b) = timeout(WAIT, async { tokio::join!(outbound, inbound) })
            .await
            .unwrap();
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert!(!a.is_eof());
    }

    #[tokio::test]
    async fn test_vsock_to_tun_write_failure() {
        let (iface, handle) = MemoryInterface::new();
        drop(handle);
        let wire = frame::encode(b"lost").unwrap();
        let closer = Closer::new();
        let stats = DirectionStats::default();

        let err = vsock_to_tun(wire.as_slice(), &iface, closer.signal(), &stats).await;
        assert_eq!(err.direction, Direction::VsockToTun);
        assert!(matches!(err.kind, PumpErrorKind::InterfaceWrite(_)));
        assert_eq!(stats.packets(), 0);
    }

    #[test]
    fn test_error_message_names_direction() {
        let err = PumpError::new(Direction::VsockToTun, PumpErrorKind::Closed);
        assert_eq!(
            err.to_string(),
            "stopped vsock-to-tun forwarding because: session closed"
        );
    }
}
