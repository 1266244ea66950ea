//! In-memory stand-ins for the tun device and the vsock listener.
//!
//! Used by the unit and integration tests to drive sessions and the engine
//! without root privileges or a hypervisor.

use async_trait::async_trait;
use std::io;
use tokio::io::DuplexStream;
use tokio::sync::{Mutex, mpsc};

use crate::engine::Acceptor;
use crate::iface::PacketInterface;

/// Channel-backed packet interface.
///
/// Packets injected through the [`MemoryInterfaceHandle`] are returned by
/// `recv`; packets passed to `send` show up on the handle.
pub struct MemoryInterface {
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

/// Test-side end of a [`MemoryInterface`].
///
/// Dropping it makes pending and future `recv` calls fail, like a tun device
/// going away.
pub struct MemoryInterfaceHandle {
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryInterface {
    pub fn new() -> (Self, MemoryInterfaceHandle) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            Self {
                inbound: Mutex::new(in_rx),
                outbound: out_tx,
            },
            MemoryInterfaceHandle {
                inbound: in_tx,
                outbound: out_rx,
            },
        )
    }
}

#[async_trait]
impl PacketInterface for MemoryInterface {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let packet = self
            .inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "interface closed"))?;

        // A tun read truncates packets that do not fit the buffer.
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        self.outbound
            .send(packet.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "interface closed"))?;
        Ok(packet.len())
    }
}

impl MemoryInterfaceHandle {
    /// Queue a packet to be read from the interface.
    pub fn inject(&self, packet: impl Into<Vec<u8>>) {
        let _ = self.inbound.send(packet.into());
    }

    /// Wait for the next packet written to the interface.
    pub async fn next_sent(&mut self) -> Option<Vec<u8>> {
        self.outbound.recv().await
    }

    /// Return a packet written to the interface, if one is already queued.
    pub fn try_next_sent(&mut self) -> Option<Vec<u8>> {
        self.outbound.try_recv().ok()
    }
}

/// Create an in-memory acceptor and the connector that feeds it.
///
/// Every connection is a [`tokio::io::duplex`] pair whose internal buffer is
/// `max_buf_size` bytes, so small values force the byte stream to be
/// delivered in small chunks.
pub fn channel_acceptor(max_buf_size: usize) -> (ChannelConnector, ChannelAcceptor) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ChannelConnector { tx, max_buf_size },
        ChannelAcceptor { rx, accepted: 0 },
    )
}

/// Client side of [`channel_acceptor`].
#[derive(Clone)]
pub struct ChannelConnector {
    tx: mpsc::UnboundedSender<DuplexStream>,
    max_buf_size: usize,
}

impl ChannelConnector {
    /// Open a connection; the peer end is handed to the acceptor.
    pub fn connect(&self) -> io::Result<DuplexStream> {
        let (client, server) = tokio::io::duplex(self.max_buf_size);
        self.tx
            .send(server)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "acceptor dropped"))?;
        Ok(client)
    }
}

/// Acceptor side of [`channel_acceptor`].
pub struct ChannelAcceptor {
    rx: mpsc::UnboundedReceiver<DuplexStream>,
    accepted: u64,
}

#[async_trait]
impl Acceptor for ChannelAcceptor {
    type Conn = DuplexStream;

    async fn accept(&mut self) -> io::Result<(DuplexStream, String)> {
        let conn = self
            .rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "all connectors dropped"))?;
        self.accepted += 1;
        Ok((conn, format!("memory-{}", self.accepted)))
    }
}
