//! Error types for vtun.

use std::io;
use thiserror::Error;

use crate::nat::NatError;
use crate::tun::TunError;

/// Configuration errors. These are user-visible and end the process.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("port must be in interval [1, {max}], got {port}", max = u32::MAX)]
    PortOutOfRange { port: u64 },

    #[error("invalid diagnostic address {addr:?}: {reason}")]
    InvalidDiagAddr { addr: String, reason: String },
}

/// Setup-time errors. Anything surfacing as this type is fatal.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("vsock error: {0}")]
    Vsock(#[source] io::Error),

    #[error("tun error: {0}")]
    Tun(#[from] TunError),

    #[error("NAT error: {0}")]
    Nat(#[from] NatError),
}

pub type Result<T> = std::result::Result<T, Error>;
