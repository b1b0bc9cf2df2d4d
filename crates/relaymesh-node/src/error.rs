//! Node error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Node is not running")]
    Stopped,

    #[error("Routing error: {0}")]
    Routing(#[from] relaymesh_routing::RoutingError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] relaymesh_crypto::CryptoError),

    #[error("Transport error: {0}")]
    Transport(#[from] relaymesh_network::TransportError),
}

/// Result type for node operations
pub type Result<T> = std::result::Result<T, NodeError>;
