//! Error types for protocol operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Invalid node ID: {0}")]
    InvalidNodeId(String),

    #[error("Invalid packet ID: {0}")]
    InvalidPacketId(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),
}

/// Failure to turn received bytes into a packet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("Unknown packet kind: {0:#04x}")]
    UnknownKind(u8),
}
