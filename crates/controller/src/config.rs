//! Controller configuration and defaults.

use kyco_event_system::ChannelConfig;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
/// The OpenFlow controller port.
pub const DEFAULT_PORT: u16 = 6633;

/// Everything the [`Controller`](crate::Controller) needs to start.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Address the protocol server listens on
    pub bind_address: SocketAddr,
    /// Root directory of core NApps
    pub core_napps_dir: PathBuf,
    /// Root directory of ordinary NApps
    pub napps_dir: PathBuf,
    /// Sizing shared by the four channels
    pub channels: ChannelConfig,
    /// How long `stop` waits for the dispatch stages to exit
    pub stage_join_timeout: Duration,
    /// Connections beyond this count are closed on accept
    pub max_connections: usize,
    /// Size of the per-connection read buffer in bytes
    pub read_buffer_size: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::new(DEFAULT_HOST, DEFAULT_PORT),
            core_napps_dir: PathBuf::from("napps/core"),
            napps_dir: PathBuf::from("napps/apps"),
            channels: ChannelConfig::default(),
            stage_join_timeout: Duration::from_secs(5),
            max_connections: 1000,
            read_buffer_size: 4096,
        }
    }
}

impl ControllerConfig {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_address: self.bind_address,
            max_connections: self.max_connections,
            read_buffer_size: self.read_buffer_size,
        }
    }
}

/// Settings used by the [`ProtocolServer`](crate::ProtocolServer).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: SocketAddr,
    pub max_connections: usize,
    pub read_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ControllerConfig::default().server_config()
    }
}
