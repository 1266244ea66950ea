//! vtun - packet tunnel between an enclave and its parent instance.
//!
//! The enclave has no network device of its own. It reaches the parent over a
//! single vsock connection, and the parent exposes a TUN device for the
//! enclave's private subnet. Raw IP packets are moved between the two in both
//! directions, one length-prefixed frame per packet.
//!
//! ## Architecture
//!
//! - **frame**: `[u16 BE length][packet]` wire format
//! - **pump**: one forwarding loop per direction
//! - **session**: one connection, two pumps, joint shutdown
//! - **engine**: accept loop running one session at a time
//! - **tun / vsock / nat**: the OS resources around the engine

pub mod config;
pub mod diag;
pub mod engine;
pub mod error;
pub mod frame;
pub mod iface;
pub mod nat;
pub mod pump;
pub mod session;
pub mod stats;
pub mod test_util;
pub mod tun;
pub mod vsock;

pub use config::{Config, Mode};
pub use engine::{Acceptor, TunnelEngine};
pub use error::{Error, Result};
pub use iface::PacketInterface;
pub use session::{Session, SessionReport, SessionState};
pub use stats::TunnelStats;
