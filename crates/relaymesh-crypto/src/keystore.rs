//! Per-peer key store
//!
//! Holds the public keys learned from Discovery packets and the
//! precomputed shared keys derived from them.

use relaymesh_protocol::NodeId;
use sodiumoxide::crypto::box_;
use std::collections::HashMap;

use crate::error::{CryptoError, Result};
use crate::identity::NodeIdentity;

/// Ciphertext plus the nonce it was sealed with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; box_::NONCEBYTES],
}

pub struct KeyStore {
    identity: NodeIdentity,
    public_keys: HashMap<NodeId, box_::PublicKey>,
    shared: HashMap<NodeId, box_::PrecomputedKey>,
}

impl KeyStore {
    pub fn new(identity: NodeIdentity) -> Self {
        KeyStore {
            identity,
            public_keys: HashMap::new(),
            shared: HashMap::new(),
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn local_id(&self) -> NodeId {
        self.identity.node_id
    }

    /// Record a peer's public key. Returns `true` when the key is new or
    /// differs from the one already stored.
    pub fn learn(&mut self, peer: NodeId, public_key: &[u8]) -> Result<bool> {
        let key = box_::PublicKey::from_slice(public_key).ok_or(CryptoError::InvalidKeyLength {
            expected: box_::PUBLICKEYBYTES,
            actual: public_key.len(),
        })?;

        if self.public_keys.get(&peer) == Some(&key) {
            return Ok(false);
        }

        let precomputed = box_::precompute(&key, self.identity.secret_key());
        self.public_keys.insert(peer, key);
        self.shared.insert(peer, precomputed);
        Ok(true)
    }

    pub fn knows(&self, peer: &NodeId) -> bool {
        self.shared.contains_key(peer)
    }

    pub fn public_key(&self, peer: &NodeId) -> Option<[u8; box_::PUBLICKEYBYTES]> {
        self.public_keys.get(peer).map(|k| k.0)
    }

    /// Encrypt for a peer whose key we hold
    pub fn seal_for(&self, peer: &NodeId, plaintext: &[u8]) -> Result<Sealed> {
        let key = self
            .shared
            .get(peer)
            .ok_or_else(|| CryptoError::UnknownPeer(peer.to_hex()))?;
        let nonce = box_::gen_nonce();
        let ciphertext = box_::seal_precomputed(plaintext, &nonce, key);
        Ok(Sealed {
            ciphertext,
            nonce: nonce.0,
        })
    }

    /// Decrypt something a peer sealed for us
    pub fn open_from(&self, peer: &NodeId, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>> {
        let key = self
            .shared
            .get(peer)
            .ok_or_else(|| CryptoError::UnknownPeer(peer.to_hex()))?;
        let nonce = box_::Nonce::from_slice(nonce).ok_or(CryptoError::InvalidNonce)?;
        box_::open_precomputed(ciphertext, &nonce, key).map_err(|_| CryptoError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (KeyStore, KeyStore) {
        crate::init().unwrap();
        let mut alice = KeyStore::new(NodeIdentity::generate());
        let mut bob = KeyStore::new(NodeIdentity::generate());
        let alice_pk = alice.identity().public_key_bytes();
        let bob_pk = bob.identity().public_key_bytes();
        alice.learn(bob.local_id(), &bob_pk).unwrap();
        bob.learn(alice.local_id(), &alice_pk).unwrap();
        (alice, bob)
    }

    #[test]
    fn test_seal_and_open() {
        let (alice, bob) = pair();
        let sealed = alice.seal_for(&bob.local_id(), b"meet at the ridge").unwrap();
        assert_ne!(sealed.ciphertext, b"meet at the ridge".to_vec());

        let plain = bob
            .open_from(&alice.local_id(), &sealed.ciphertext, &sealed.nonce)
            .unwrap();
        assert_eq!(plain, b"meet at the ridge".to_vec());
    }

    #[test]
    fn test_unknown_peer() {
        crate::init().unwrap();
        let store = KeyStore::new(NodeIdentity::generate());
        let stranger = NodeIdentity::generate().node_id;
        assert!(matches!(
            store.seal_for(&stranger, b"hi"),
            Err(CryptoError::UnknownPeer(_))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let (alice, bob) = pair();
        let mut sealed = alice.seal_for(&bob.local_id(), b"payload").unwrap();
        sealed.ciphertext[0] ^= 1;
        assert_eq!(
            bob.open_from(&alice.local_id(), &sealed.ciphertext, &sealed.nonce),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_learn_reports_changes() {
        crate::init().unwrap();
        let mut store = KeyStore::new(NodeIdentity::generate());
        let peer = NodeIdentity::generate();
        let pk = peer.public_key_bytes();

        assert!(store.learn(peer.node_id, &pk).unwrap());
        assert!(!store.learn(peer.node_id, &pk).unwrap());
        assert!(store.knows(&peer.node_id));
        assert!(store.learn(peer.node_id, &[1u8; 3]).is_err());
    }
}
