//! Transport error types

use thiserror::Error;

/// Transport-specific errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Peer not connected: {0}")]
    NotConnected(String),

    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Inbound sink already registered")]
    AlreadyRegistered,

    #[error("Transport initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Datagram too large: {size} bytes (max {max})")]
    DatagramTooLarge { size: usize, max: usize },

    #[error("Transport is shut down")]
    Shutdown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;
