//! Server configuration
//!
//! Every well-known constant the simulator uses (ports, program numbers are fixed
//! by the protocol, everything else lives here) is carried in [`ServerConfig`] and
//! handed to each component when it is built. A TOML file may override the
//! defaults; the command line overrides the file.

use crate::error::{NetinstrError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

/// Largest instrument count accepted from the command line
pub const MAX_CLI_INSTRUMENTS: u32 = 10;

/// Hard upper bound on the link table
pub const MAX_INSTRUMENTS: u32 = 999;

/// Simulator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address all listeners bind to
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Portmapper port (TCP and UDP)
    #[serde(default = "default_rpcbind_port")]
    pub rpcbind_port: u16,

    /// First port of the VXI-11 rotation range
    #[serde(default = "default_vxi11_port_start")]
    pub vxi11_port_start: u16,

    /// Last port of the VXI-11 rotation range (inclusive)
    #[serde(default = "default_vxi11_port_end")]
    pub vxi11_port_end: u16,

    /// Number of GPIB sub-instruments behind the server, 0 for a lone instrument
    #[serde(default)]
    pub num_instruments: u32,

    /// Run the TCP portmapper
    #[serde(default = "default_true")]
    pub tcp_portmapper: bool,

    /// Run the UDP portmapper
    #[serde(default = "default_true")]
    pub udp_portmapper: bool,

    /// Reply to every DEVICE_READ, suffixed with the link id
    #[serde(default = "default_id_string")]
    pub id_string: String,

    /// Maximum receive size advertised in CREATE_LINK replies
    #[serde(default = "default_max_recv_size")]
    pub max_recv_size: u32,

    /// Protocol-level logging (VXI-11 requests)
    #[serde(default)]
    pub log_vxi11: bool,

    /// Mapping-level logging (portmapper traffic and port rotation)
    #[serde(default)]
    pub log_mapping: bool,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_rpcbind_port() -> u16 {
    111
}

fn default_vxi11_port_start() -> u16 {
    9010
}

fn default_vxi11_port_end() -> u16 {
    9019
}

fn default_true() -> bool {
    true
}

fn default_id_string() -> String {
    "IDN-DUMMY".to_string()
}

fn default_max_recv_size() -> u32 {
    0x0080_0000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            rpcbind_port: default_rpcbind_port(),
            vxi11_port_start: default_vxi11_port_start(),
            vxi11_port_end: default_vxi11_port_end(),
            num_instruments: 0,
            tcp_portmapper: true,
            udp_portmapper: true,
            id_string: default_id_string(),
            max_recv_size: default_max_recv_size(),
            log_vxi11: false,
            log_mapping: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                NetinstrError::config(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(NetinstrError::Io(e)),
        }
    }

    /// Address of the portmapper listeners
    pub fn rpcbind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.rpcbind_port)
    }

    /// Address of the VXI-11 listener for `port`
    pub fn vxi11_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.host, port)
    }

    /// Rules enforced by the daemon before anything is bound
    pub fn validate(&self) -> Result<()> {
        if !self.tcp_portmapper && !self.udp_portmapper {
            return Err(NetinstrError::config(
                "at least one of the TCP or UDP portmappers must be enabled",
            ));
        }

        if self.num_instruments > MAX_CLI_INSTRUMENTS {
            return Err(NetinstrError::config(format!(
                "the number of instruments must be {} or less",
                MAX_CLI_INSTRUMENTS
            )));
        }

        self.validate_server()
    }

    /// Rules the server itself relies on, looser than the command line limits
    pub fn validate_server(&self) -> Result<()> {
        if self.num_instruments > MAX_INSTRUMENTS {
            return Err(NetinstrError::config(
                "the number of instruments must be less than 1000",
            ));
        }

        if self.vxi11_port_start == 0 || self.vxi11_port_start > self.vxi11_port_end {
            return Err(NetinstrError::config(format!(
                "invalid VXI-11 port range {}-{}",
                self.vxi11_port_start, self.vxi11_port_end
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.rpcbind_addr().to_string(), "0.0.0.0:111");
        assert_eq!(config.vxi11_port_start, 9010);
        assert_eq!(config.vxi11_port_end, 9019);
        assert_eq!(config.num_instruments, 0);
        assert_eq!(config.id_string, "IDN-DUMMY");
        assert_eq!(config.max_recv_size, 0x0080_0000);
        assert!(config.tcp_portmapper && config.udp_portmapper);
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_requires_a_transport() {
        let config = ServerConfig {
            tcp_portmapper: false,
            udp_portmapper: false,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            tcp_portmapper: false,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_instrument_count() {
        let mut config = ServerConfig {
            num_instruments: 10,
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.num_instruments = 11;
        assert!(config.validate().is_err());
        assert!(config.validate_server().is_ok());

        config.num_instruments = 1000;
        assert!(config.validate_server().is_err());
    }

    #[test]
    fn test_validate_port_range() {
        let config = ServerConfig {
            vxi11_port_start: 9020,
            vxi11_port_end: 9010,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let single = ServerConfig {
            vxi11_port_start: 9010,
            vxi11_port_end: 9010,
            ..Default::default()
        };
        assert!(single.validate().is_ok());
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_str = r#"
host = "127.0.0.1"
rpcbind_port = 1111
num_instruments = 3
udp_portmapper = false
"#;
        let config: ServerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.rpcbind_addr().to_string(), "127.0.0.1:1111");
        assert_eq!(config.num_instruments, 3);
        assert!(!config.udp_portmapper);
        // Unspecified values should use defaults
        assert!(config.tcp_portmapper);
        assert_eq!(config.vxi11_port_start, 9010);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "vxi11_port_start = 19010").unwrap();
        writeln!(file, "vxi11_port_end = 19012").unwrap();

        let config = ServerConfig::load_or_default(file.path()).unwrap();
        assert_eq!(config.vxi11_port_start, 19010);
        assert_eq!(config.vxi11_port_end, 19012);
    }

    #[test]
    fn test_load_bad_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "rpcbind_port = \"not a port\"").unwrap();
        assert!(matches!(
            ServerConfig::load_or_default(file.path()),
            Err(NetinstrError::Configuration(_))
        ));
    }

    #[test]
    fn test_load_nonexistent_file_defaults() {
        let config = ServerConfig::load_or_default("/nonexistent/vxi11d.toml").unwrap();
        assert_eq!(config, ServerConfig::default());
    }
}
