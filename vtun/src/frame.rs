//! Length-prefixed packet framing for the vsock byte stream.
//!
//! Every packet crossing the vsock connection is sent as
//! `[u16 big-endian length L][L bytes of raw IP packet]`. There is no
//! handshake and no other header.

use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the length prefix in bytes.
pub const LEN_PREFIX_SIZE: usize = 2;

/// Largest payload a frame can carry. Also the MTU of the tun device.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Framing errors.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("payload of {len} bytes exceeds maximum of {MAX_PAYLOAD}")]
    PayloadTooLarge { len: usize },

    #[error("short read: {0}")]
    ShortRead(#[source] io::Error),
}

impl FrameError {
    /// True if the stream ended cleanly where a frame was expected.
    pub fn is_eof(&self) -> bool {
        matches!(self, FrameError::ShortRead(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Encode a single payload into a freshly allocated frame.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let prefix = len_prefix(payload.len())?;
    let mut frame = Vec::with_capacity(LEN_PREFIX_SIZE + payload.len());
    frame.extend_from_slice(&prefix);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Read exactly one frame from `reader` and return its payload.
///
/// Either a complete payload is returned or an error; partial frames are
/// never handed out.
pub async fn decode<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LEN_PREFIX_SIZE];
    reader
        .read_exact(&mut prefix)
        .await
        .map_err(FrameError::ShortRead)?;

    let mut payload = vec![0u8; u16::from_be_bytes(prefix) as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(FrameError::ShortRead)?;
    Ok(payload)
}

fn len_prefix(len: usize) -> Result<[u8; LEN_PREFIX_SIZE], FrameError> {
    u16::try_from(len)
        .map(u16::to_be_bytes)
        .map_err(|_| FrameError::PayloadTooLarge { len })
}

/// Reusable frame buffer owned by a forwarding pump.
///
/// Holds the length prefix and one MTU worth of payload back to back, so a
/// sealed frame goes out in a single write and no allocation happens per
/// packet.
pub struct FrameBuffer {
    buf: Box<[u8]>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; LEN_PREFIX_SIZE + MAX_PAYLOAD].into_boxed_slice(),
        }
    }

    /// Payload area, sized to [`MAX_PAYLOAD`].
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[LEN_PREFIX_SIZE..]
    }

    /// Write the prefix for a payload of `len` bytes already placed in
    /// [`payload_mut`](Self::payload_mut) and return the whole frame.
    pub fn seal(&mut self, len: usize) -> Result<&[u8], FrameError> {
        let prefix = len_prefix(len)?;
        self.buf[..LEN_PREFIX_SIZE].copy_from_slice(&prefix);
        Ok(&self.buf[..LEN_PREFIX_SIZE + len])
    }

    /// Decode one frame from `reader` into this buffer and return the payload.
    pub async fn read_from<R>(&mut self, reader: &mut R) -> Result<&[u8], FrameError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let (prefix, payload) = self.buf.split_at_mut(LEN_PREFIX_SIZE);
        reader
            .read_exact(prefix)
            .await
            .map_err(FrameError::ShortRead)?;

        let len = u16::from_be_bytes([prefix[0], prefix[1]]) as usize;
        reader
            .read_exact(&mut payload[..len])
            .await
            .map_err(FrameError::ShortRead)?;
        Ok(&payload[..len])
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
