//! Routing error types

use thiserror::Error;

/// Routing-specific errors
#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Unknown chat: {0}")]
    UnknownChat(String),

    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("Invalid group: {0}")]
    InvalidGroup(String),

    #[error("Message cannot be retried in status {0:?}")]
    NotRetryable(crate::chat::MessageStatus),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Identity record is corrupt: {0}")]
    IdentityCorrupt(String),

    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] relaymesh_protocol::ProtocolError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] relaymesh_crypto::CryptoError),

    #[error("Transport error: {0}")]
    Transport(#[from] relaymesh_network::TransportError),
}

/// Result type for routing operations
pub type Result<T> = std::result::Result<T, RoutingError>;
