//! TUN device creation and configuration.
//!
//! The device is a Layer 3 TUN (raw IP packets, no Ethernet header) opened
//! with IFF_NO_PI, so every read yields exactly one packet.

use async_trait::async_trait;
use futures::TryStreamExt;
use ipnet::Ipv4Net;
use nix::libc;
use rtnetlink::Handle;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tracing::{debug, info, warn};

use crate::frame::MAX_PAYLOAD;
use crate::iface::PacketInterface;

/// Default TUN device name.
pub const TUN_NAME: &str = "tun0";

/// MTU of the TUN device, the largest payload a frame can carry.
pub const TUN_MTU: u32 = MAX_PAYLOAD as u32;

/// TUN device flags from linux/if_tun.h
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// ioctl request code for TUNSETIFF
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// ifreq structure for TUN device configuration
#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// TUN setup errors.
#[derive(Debug, Error)]
pub enum TunError {
    #[error("TUN device I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("netlink request failed: {0}")]
    Netlink(String),

    #[error("interface {0} not found")]
    NotFound(String),
}

/// Address configuration applied to the TUN device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunConfig {
    pub name: String,
    pub address: Ipv4Net,
    pub mtu: u32,
    /// Default gateway routed through the device, if any.
    pub gateway: Option<Ipv4Addr>,
}

impl TunConfig {
    /// Parent side: `10.0.0.1/24`, no default route.
    pub fn proxy(name: &str) -> Self {
        Self {
            name: name.to_string(),
            address: Ipv4Net::new_assert(Ipv4Addr::new(10, 0, 0, 1), 24),
            mtu: TUN_MTU,
            gateway: None,
        }
    }

    /// Enclave side: `10.0.0.2/24`, default route via the parent.
    pub fn enclave(name: &str) -> Self {
        Self {
            name: name.to_string(),
            address: Ipv4Net::new_assert(Ipv4Addr::new(10, 0, 0, 2), 24),
            mtu: TUN_MTU,
            gateway: Some(Ipv4Addr::new(10, 0, 0, 1)),
        }
    }

    /// The subnet behind the device, e.g. `10.0.0.0/24`.
    pub fn subnet(&self) -> Ipv4Net {
        self.address.trunc()
    }
}

/// An open TUN device registered with the tokio reactor.
pub struct TunDevice {
    name: String,
    fd: AsyncFd<File>,
}

impl TunDevice {
    /// Create (or attach to) the TUN device `name`.
    pub fn create(name: &str) -> Result<Self, TunError> {
        let name_bytes = name.as_bytes();
        if name_bytes.is_empty() || name_bytes.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid TUN device name").into());
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")?;

        let mut ifr = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 22],
        };
        for (i, &b) in name_bytes.iter().enumerate() {
            ifr.ifr_name[i] = b as libc::c_char;
        }

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }

        info!(name, "TUN device created");
        Ok(Self {
            name: name.to_string(),
            fd: AsyncFd::new(file)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Assign the address and MTU, bring the link up and install the default
    /// route if one is configured.
    pub async fn configure(&self, config: &TunConfig) -> Result<(), TunError> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        let index = link_index(&handle, &self.name).await?;

        match handle
            .address()
            .add(index, IpAddr::V4(config.address.addr()), config.address.prefix_len())
            .execute()
            .await
        {
            Ok(()) => {}
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::EEXIST => {
                warn!(addr = %config.address, name = %self.name, "Address already assigned");
            }
            Err(e) => return Err(TunError::Netlink(e.to_string())),
        }

        handle
            .link()
            .set(index)
            .mtu(config.mtu)
            .execute()
            .await
            .map_err(|e| TunError::Netlink(e.to_string()))?;

        handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| TunError::Netlink(e.to_string()))?;

        if let Some(gateway) = config.gateway {
            match handle
                .route()
                .add()
                .v4()
                .gateway(gateway)
                .output_interface(index)
                .execute()
                .await
            {
                Ok(()) => {}
                Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::EEXIST => {
                    warn!(gateway = %gateway, name = %self.name, "Default route already exists");
                }
                Err(e) => return Err(TunError::Netlink(e.to_string())),
            }
        }

        info!(
            name = %self.name,
            addr = %config.address,
            mtu = config.mtu,
            gateway = ?config.gateway,
            "TUN device configured"
        );
        Ok(())
    }
}

async fn link_index(handle: &Handle, name: &str) -> Result<u32, TunError> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(Some(link)) => Ok(link.header.index),
        Ok(None) => Err(TunError::NotFound(name.to_string())),
        Err(e) => Err(TunError::Netlink(e.to_string())),
    }
}

#[async_trait]
impl PacketInterface for TunDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| inner.get_ref().read(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| inner.get_ref().write(packet)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        debug!(name = %self.name, "TUN device closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_config() {
        let cfg = TunConfig::proxy(TUN_NAME);
        assert_eq!(cfg.address.to_string(), "10.0.0.1/24");
        assert_eq!(cfg.mtu, 65535);
        assert_eq!(cfg.gateway, None);
        assert_eq!(cfg.subnet().to_string(), "10.0.0.0/24");
    }

    #[test]
    fn test_enclave_config() {
        let cfg = TunConfig::enclave("tun1");
        assert_eq!(cfg.name, "tun1");
        assert_eq!(cfg.address.to_string(), "10.0.0.2/24");
        assert_eq!(cfg.gateway, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(cfg.subnet(), cfg.address.trunc());
    }

    #[test]
    fn test_invalid_names_rejected() {
        for name in [String::new(), "x".repeat(libc::IFNAMSIZ)] {
            match TunDevice::create(&name) {
                Err(TunError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::InvalidInput),
                Err(e) => panic!("unexpected error: {e}"),
                Ok(_) => panic!("name {name:?} accepted"),
            }
        }
    }
}
