//! RelayMesh Cryptography Module
//!
//! Node identity (X25519 keypair and the node id derived from it) and the
//! per-peer key store used for end-to-end message encryption with
//! libsodium's `crypto_box` (X25519 + XSalsa20-Poly1305).

pub mod error;
pub mod identity;
pub mod keystore;

pub use error::{CryptoError, Result};
pub use identity::NodeIdentity;
pub use keystore::{KeyStore, Sealed};

/// Initialize libsodium. Must be called before any other crypto operation.
pub fn init() -> Result<()> {
    sodiumoxide::init().map_err(|_| CryptoError::InitializationFailed)
}
