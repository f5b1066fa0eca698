//! Server configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use h1emu_keepalive::KeepaliveConfig;
use h1emu_transport::BridgeConfig;
use serde::{Deserialize, Serialize};

use crate::H1emuError;

/// Settings for an H1emu server.
///
/// Every field has a default, so a config file only needs the keys it
/// changes. Keys are camelCase and durations are milliseconds:
///
/// ```json
/// { "serverPort": 1110, "pingTime": 5000, "pingTimeout": 12000 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// UDP port to listen on. 0 lets the OS pick one.
    pub server_port: u16,

    /// Local address to bind. Default: `0.0.0.0`.
    pub bind_address: IpAddr,

    /// Ping timer period, in ms. Default: 5000.
    pub ping_time: u64,

    /// Idle window before a silent peer is evicted, in ms. Default: 12000.
    pub ping_timeout: u64,

    /// Receive buffer size, in bytes. Default: 512.
    pub max_datagram_size: usize,

    /// Upper bound of the random delay before a session's first ping, in
    /// ms. Default: 100.
    pub initial_ping_jitter: u64,

    /// How long `stop()` waits for queued sends to flush, in ms.
    /// Default: 1000.
    pub shutdown_grace: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_port: 0,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ping_time: 5_000,
            ping_timeout: 12_000,
            max_datagram_size: 512,
            initial_ping_jitter: 100,
            shutdown_grace: 1_000,
        }
    }
}

impl ServerConfig {
    /// Parses a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self, H1emuError> {
        serde_json::from_str(json).map_err(|e| H1emuError::Config(e.to_string()))
    }

    /// Reads and parses a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, H1emuError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            H1emuError::Config(format!("{}: {e}", path.display()))
        })?;
        Self::from_json_str(&json)
    }

    /// The socket address to bind.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.server_port)
    }

    /// Keepalive timing derived from this config.
    pub fn keepalive(&self) -> KeepaliveConfig {
        KeepaliveConfig {
            ping_interval: Duration::from_millis(self.ping_time),
            ping_timeout: Duration::from_millis(self.ping_timeout),
            initial_ping_jitter: Duration::from_millis(self.initial_ping_jitter),
        }
    }

    /// I/O context settings derived from this config.
    pub fn bridge(&self) -> BridgeConfig {
        BridgeConfig {
            max_datagram_size: self.max_datagram_size,
        }
    }

    /// `shutdown_grace` as a `Duration`.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace)
    }
}
