//! Packet interface capability.
//!
//! The forwarding pumps only need to read and write whole IP packets. Keeping
//! that behind a trait lets the tun device and in-memory test interfaces be
//! used interchangeably.

use async_trait::async_trait;
use std::io;

/// A device that delivers and accepts whole raw IP packets.
///
/// Methods take `&self` so a single interface can be read by one pump and
/// written by the other at the same time.
#[async_trait]
pub trait PacketInterface: Send + Sync {
    /// Receive one packet into `buf`, returning its length.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send one packet.
    async fn send(&self, packet: &[u8]) -> io::Result<usize>;
}
