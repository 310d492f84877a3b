use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in the mirror core
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("failed to open lower device {path}: {source}")]
    LowerDeviceOpenFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("lower device {0} is already claimed by another device")]
    LowerDeviceInUse(PathBuf),

    #[error("lower device too small: {have_kib} KiB available, {need_kib} KiB requested")]
    LowerDeviceTooSmall { have_kib: u64, need_kib: u64 },

    #[error("local address {0} is already in use by another device")]
    LocalAddrInUse(SocketAddr),

    #[error("peer address {0} is already in use by another device")]
    PeerAddrInUse(SocketAddr),

    #[error("device is not configured")]
    NotConfigured,

    #[error("device is not connected")]
    NotConnected,

    #[error("device is busy")]
    DeviceBusy,

    #[error("device is read-only in the Secondary role")]
    ReadOnly,

    #[error("resynchronisation in progress")]
    SyncInProgress,

    #[error("invalid block request: {0}")]
    InvalidRequest(String),

    #[error("peer connection lost")]
    Disconnected,

    #[error("device taken offline after lower device failure")]
    Offline,
}

pub type Result<T> = std::result::Result<T, MirrorError>;
