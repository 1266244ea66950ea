//! Runtime configuration, built once at startup and immutable afterwards.

use clap::ValueEnum;

use crate::error::ConfigError;
use crate::tun::{TUN_NAME, TunConfig};
use crate::vsock::{DEFAULT_PORT, PARENT_CID};

/// Default address of the diagnostic endpoint.
pub const DIAG_ADDR: &str = "localhost:6060";

/// Which end of the tunnel this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Parent instance: listens on vsock, owns the NAT rules.
    Proxy,
    /// Inside the enclave: dials the parent, routes everything through it.
    Enclave,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    /// vsock port; listened on in proxy mode, dialed in enclave mode.
    pub port: u32,
    /// CID dialed in enclave mode.
    pub parent_cid: u32,
    pub tun_name: String,
    /// Serve the diagnostic endpoint.
    pub profile: bool,
    pub diag_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Proxy,
            port: DEFAULT_PORT,
            parent_cid: PARENT_CID,
            tun_name: TUN_NAME.to_string(),
            profile: false,
            diag_addr: DIAG_ADDR.to_string(),
        }
    }
}

impl Config {
    /// Check a raw port value against `[1, u32::MAX]`.
    pub fn validate_port(port: u64) -> Result<u32, ConfigError> {
        match u32::try_from(port) {
            Ok(p) if p >= 1 => Ok(p),
            _ => Err(ConfigError::PortOutOfRange { port }),
        }
    }

    /// Check that the diagnostic address has a `host:port` shape. Resolving
    /// happens when the endpoint binds.
    pub fn validate_diag_addr(addr: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidDiagAddr {
            addr: addr.to_string(),
            reason: reason.to_string(),
        };
        let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
        Ok(())
    }

    /// Address configuration of the TUN device for this mode.
    pub fn tun_config(&self) -> TunConfig {
        match self.mode {
            Mode::Proxy => TunConfig::proxy(&self.tun_name),
            Mode::Enclave => TunConfig::enclave(&self.tun_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_bounds() {
        assert_eq!(Config::validate_port(1).unwrap(), 1);
        assert_eq!(Config::validate_port(1024).unwrap(), 1024);
        assert_eq!(Config::validate_port(u32::MAX as u64).unwrap(), u32::MAX);
        assert!(matches!(
            Config::validate_port(0),
            Err(ConfigError::PortOutOfRange { port: 0 })
        ));
        assert!(Config::validate_port(u32::MAX as u64 + 1).is_err());
    }

    #[test]
    fn test_port_error_message() {
        let err = Config::validate_port(0).unwrap_err();
        assert_eq!(
            err.to_string(),
            "port must be in interval [1, 4294967295], got 0"
        );
    }

    #[test]
    fn test_diag_addr() {
        assert!(Config::validate_diag_addr("localhost:6060").is_ok());
        assert!(Config::validate_diag_addr("[::1]:6060").is_ok());
        assert!(Config::validate_diag_addr("localhost").is_err());
        assert!(Config::validate_diag_addr(":6060").is_err());
        assert!(Config::validate_diag_addr("localhost:http").is_err());
    }

    #[test]
    fn test_tun_config_per_mode() {
        let mut config = Config::default();
        assert_eq!(config.tun_config(), TunConfig::proxy(TUN_NAME));

        config.mode = Mode::Enclave;
        config.tun_name = "tun7".to_string();
        assert_eq!(config.tun_config(), TunConfig::enclave("tun7"));
    }
}
