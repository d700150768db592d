//! Error types

use std::net::SocketAddr;
use thiserror::Error;

/// Failures decoding a frame handed to the wire codec
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Malformed header: needed {needed} bytes, got {available}")]
    MalformedHeader { needed: usize, available: usize },

    #[error("Payload too large: {declared} bytes (max: {max})")]
    PayloadTooLarge { declared: u64, max: usize },

    #[error("Truncated payload: expected {expected} bytes, got {available}")]
    TruncatedPayload { expected: usize, available: usize },
}

/// Failures handing a command to the device executor
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Dispatch channel full")]
    Full,

    /// The executor side of the channel is gone, or never started
    #[error("Device executor unavailable")]
    ExecutorUnavailable,
}

/// Errors that end the server
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network bring-up failed: {0}")]
    NetworkBringUp(#[source] std::io::Error),

    #[error("Could not listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The client detached and the detach policy asks for a process restart
    #[error("Restart required after device detach")]
    RestartRequired,

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
