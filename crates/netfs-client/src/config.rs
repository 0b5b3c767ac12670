//! Client configuration.
//!
//! One TOML document with a section per concern. Every section has defaults,
//! so an empty file is a valid configuration.

use std::time::Duration;

use netfs_config::{Config, ConfigError, require_nonzero};
use netfs_logging::LogConfig;
use netfs_proto::{DEFAULT_BROADCAST_PORT, DEFAULT_CONNECTION_PORT, DEFAULT_SERVER_INFO_PORT};
use netfs_types::MountId;
use serde::{Deserialize, Serialize};

/// Identity the mount presents to the host VFS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Device id reported in stat and dirent results.
    pub mount_id: MountId,
    pub uid: u32,
    pub gid: u32,
    /// Reject every mutation regardless of share permissions.
    pub read_only: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            mount_id: MountId(1),
            uid: 0,
            gid: 0,
            read_only: false,
        }
    }
}

/// Credentials offered to every share that asks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Listen for server broadcasts. Servers can still be added by name.
    pub enabled: bool,
    /// Broadcast a client hello at start-up so servers announce themselves.
    pub hello_on_start: bool,
    pub broadcast_port: u16,
    pub server_info_port: u16,
    pub connection_port: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hello_on_start: true,
            broadcast_port: DEFAULT_BROADCAST_PORT,
            server_info_port: DEFAULT_SERVER_INFO_PORT,
            connection_port: DEFAULT_CONNECTION_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Streams carrying client calls; bounds the calls in flight per server.
    pub upstream_channels: usize,
    /// Streams carrying server pushes, one reader task each.
    pub downstream_channels: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            upstream_channels: 4,
            downstream_channels: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Bound on one request/reply exchange.
    #[serde(with = "secs_f64")]
    pub rpc_timeout: Duration,

    /// Bound on one server-info fetch attempt.
    #[serde(with = "secs_f64")]
    pub server_info_timeout: Duration,

    #[serde(with = "secs_f64")]
    pub retry_init_wait: Duration,

    #[serde(with = "secs_f64")]
    pub retry_max_wait: Duration,

    /// Budget for all attempts of one server-info fetch.
    #[serde(with = "secs_f64")]
    pub retry_total_time: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(5),
            server_info_timeout: Duration::from_secs(5),
            retry_init_wait: Duration::from_millis(500),
            retry_max_wait: Duration::from_secs(2),
            retry_total_time: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub mount: MountConfig,
    pub auth: AuthConfig,
    pub discovery: DiscoveryConfig,
    pub connection: ConnectionConfig,
    pub retry: RetryConfig,
    pub log: LogConfig,
}

impl Config for ClientConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero("discovery.broadcast_port", self.discovery.broadcast_port)?;
        require_nonzero("discovery.server_info_port", self.discovery.server_info_port)?;
        require_nonzero("discovery.connection_port", self.discovery.connection_port)?;
        require_nonzero("connection.upstream_channels", self.connection.upstream_channels)?;
        if self.retry.rpc_timeout.is_zero() {
            return Err(ConfigError::OutOfRange {
                field: "retry.rpc_timeout",
                message: "must be positive".into(),
            });
        }
        if self.retry.retry_init_wait > self.retry.retry_max_wait {
            return Err(ConfigError::OutOfRange {
                field: "retry.retry_init_wait",
                message: format!(
                    "{:?} exceeds retry_max_wait {:?}",
                    self.retry.retry_init_wait, self.retry.retry_max_wait
                ),
            });
        }
        Ok(())
    }

    /// Timeouts and the log level apply to later calls; everything else is
    /// fixed once the root volume is mounted.
    fn hot_update(&mut self, other: &Self) {
        self.retry = other.retry.clone();
        self.log.level = other.log.level.clone();
    }
}

/// Serializes a `Duration` as fractional seconds.
mod secs_f64 {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
