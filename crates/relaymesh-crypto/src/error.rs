//! Error types for cryptographic operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CryptoError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Failed to initialize libsodium")]
    InitializationFailed,

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid nonce")]
    InvalidNonce,

    #[error("No public key known for peer {0}")]
    UnknownPeer(String),

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Corrupt identity record: {0}")]
    CorruptIdentity(String),
}
