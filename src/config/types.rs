//! Configuration Types

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub manager: ManagerConfig,
    pub ttl: TtlConfig,
    pub gc: GcConfig,
    pub logging: LoggingConfig,
}

/// How `read_message` obtains messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    /// Frames are read straight off the socket by the caller
    Sync,
    /// An inbound reader per physical connection demultiplexes frames into queues
    Async,
}

/// How raw socket reads and writes behave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketMode {
    /// Transfer the whole buffer, bounded by the request timeout
    Blocking,
    /// Transfer whatever the socket accepts right now, possibly nothing
    NonBlocking,
}

/// Connection manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManagerConfig {
    pub read_mode: ReadMode,
    pub socket_mode: SocketMode,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub max_message_size: usize,
    pub max_logical_connections: usize,
    pub tcp_nodelay: bool,
}

/// Idle time-to-live of unreferenced physical connections, per server role
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TtlConfig {
    #[serde(with = "humantime_serde")]
    pub redirector: Duration,
    #[serde(with = "humantime_serde")]
    pub data_server: Duration,
}

/// Garbage collector configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GcConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            manager: ManagerConfig {
                read_mode: ReadMode::Async,
                socket_mode: SocketMode::Blocking,
                connect_timeout: Duration::from_secs(10),
                request_timeout: Duration::from_secs(30),
                max_message_size: 16 * 1024 * 1024,
                max_logical_connections: 65535,
                tcp_nodelay: true,
            },
            ttl: TtlConfig {
                redirector: Duration::from_secs(1200),
                data_server: Duration::from_secs(300),
            },
            gc: GcConfig {
                enabled: true,
                interval: Duration::from_millis(2),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}
