use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Wire protocol level negotiated with the peer.
///
/// Controls when a write submitted on the Primary is reported complete:
/// - `A`: local write done and the packet was handed to the socket
/// - `B`: local write done and the peer acknowledged receipt
/// - `C`: local write done and the peer acknowledged its own disk write
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    A,
    B,
    C,
}

impl Protocol {
    pub fn as_u32(self) -> u32 {
        match self {
            Protocol::A => 1,
            Protocol::B => 2,
            Protocol::C => 3,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Protocol::A),
            2 => Some(Protocol::B),
            3 => Some(Protocol::C),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::A => write!(f, "A"),
            Protocol::B => write!(f, "B"),
            Protocol::C => write!(f, "C"),
        }
    }
}

/// Lower device configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DiskConfig {
    /// Path to the lower block device (or backing file)
    pub path: PathBuf,
    /// Optional device size hint in KiB
    /// The replicated device never exceeds this size; it must not exceed
    /// the capacity of the lower device
    #[serde(default)]
    pub size_kib: Option<u64>,
    /// Take the device fatally offline when the lower device reports an
    /// I/O error, instead of failing the single request
    #[serde(default)]
    pub panic_on_disk_error: bool,
}

/// Replication link configuration
#[derive(Debug, Deserialize, Clone)]
pub struct NetConfig {
    /// Address to bind when falling back to listening
    pub my_addr: SocketAddr,
    /// Address of the peer node
    pub peer_addr: SocketAddr,
    /// Wire protocol: "a", "b" or "c"
    pub protocol: Protocol,
    /// Network timeout in tenths of a second; 0 disables the send and
    /// acknowledgement timers
    #[serde(default = "default_timeout")]
    pub timeout: u32,
    /// Resynchronisation rate limit in KiB/s
    #[serde(default = "default_sync_rate")]
    pub sync_rate: u32,
    /// Skip resynchronisation entirely on connect
    #[serde(default)]
    pub skip_sync: bool,
    /// Capacity of the transfer log ring (in-flight writes + barriers)
    #[serde(default = "default_tl_size")]
    pub tl_size: usize,
    /// Seconds of receive idleness before a Ping probes the peer;
    /// 0 disables the probe
    #[serde(default = "default_ping_int")]
    pub ping_int: u64,
    /// Seconds to wait for an inbound connection before retrying the
    /// outbound connect
    #[serde(default = "default_try_connect_int")]
    pub try_connect_int: u64,
}

impl NetConfig {
    /// Full network timeout, or `None` when disabled.
    pub fn timeout_duration(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_millis(u64::from(self.timeout) * 100))
    }

    /// Half the network timeout; the processing timer interval on the
    /// Secondary, so a Postpone always beats the peer's ack timer.
    pub fn half_timeout_duration(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_millis(u64::from(self.timeout) * 50))
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_int > 0).then(|| Duration::from_secs(self.ping_int))
    }

    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_secs(self.try_connect_int.max(1))
    }
}

/// Meta-data store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct MetaConfig {
    /// Directory holding the per-device generation-counter files
    #[serde(default = "default_meta_dir")]
    pub dir: PathBuf,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self { dir: default_meta_dir() }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    /// Can be overridden at runtime via RUST_LOG
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Show module path (target) in log messages
    #[serde(default)]
    pub show_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), show_target: false }
    }
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Device identity; also selects the meta-data file name
    #[serde(default)]
    pub minor: u32,
    /// Lower device configuration
    pub disk: DiskConfig,
    /// Replication link configuration
    pub net: NetConfig,
    /// Meta-data store configuration
    #[serde(default)]
    pub meta: MetaConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_timeout() -> u32 {
    60
}

fn default_sync_rate() -> u32 {
    250
}

fn default_tl_size() -> usize {
    256
}

fn default_ping_int() -> u64 {
    10
}

fn default_try_connect_int() -> u64 {
    10
}

fn default_meta_dir() -> PathBuf {
    PathBuf::from("/var/lib/muninn")
}

fn default_log_level() -> String {
    "info".to_string()
}
