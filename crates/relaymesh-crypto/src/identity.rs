//! Node identity
//!
//! An identity is created once, on first run, and never mutated. The node
//! id is a pure function of the public key.

use relaymesh_protocol::NodeId;
use serde::{Deserialize, Serialize};
use sodiumoxide::crypto::box_;

use crate::error::{CryptoError, Result};

/// Persisted form of an identity
#[derive(Serialize, Deserialize)]
struct IdentityRecord {
    public_key: [u8; box_::PUBLICKEYBYTES],
    secret_key: [u8; box_::SECRETKEYBYTES],
}

#[derive(Clone)]
pub struct NodeIdentity {
    pub node_id: NodeId,
    pub public_key: box_::PublicKey,
    secret_key: box_::SecretKey,
}

impl NodeIdentity {
    /// Generate a fresh keypair
    pub fn generate() -> Self {
        let (public_key, secret_key) = box_::gen_keypair();
        Self::from_keypair(public_key, secret_key)
    }

    fn from_keypair(public_key: box_::PublicKey, secret_key: box_::SecretKey) -> Self {
        NodeIdentity {
            node_id: NodeId::from_public_key(public_key.as_ref()),
            public_key,
            secret_key,
        }
    }

    pub fn public_key_bytes(&self) -> [u8; box_::PUBLICKEYBYTES] {
        self.public_key.0
    }

    pub(crate) fn secret_key(&self) -> &box_::SecretKey {
        &self.secret_key
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let record = IdentityRecord {
            public_key: self.public_key.0,
            secret_key: self.secret_key.0,
        };
        bincode::serialize(&record).map_err(|e| CryptoError::CorruptIdentity(e.to_string()))
    }

    /// Restore a persisted identity, rejecting records whose public key
    /// does not belong to the stored secret key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let record: IdentityRecord = bincode::deserialize(bytes)
            .map_err(|e| CryptoError::CorruptIdentity(e.to_string()))?;

        let secret_key = box_::SecretKey(record.secret_key);
        let public_key = box_::PublicKey(record.public_key);

        if secret_key.public_key() != public_key {
            return Err(CryptoError::CorruptIdentity(
                "public key does not match secret key".to_string(),
            ));
        }

        Ok(Self::from_keypair(public_key, secret_key))
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id)
            .field("public_key", &hex::encode(self.public_key.0))
            .finish_non_exhaustive()
    }
}
