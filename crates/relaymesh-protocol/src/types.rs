//! Core protocol types

use blake2::{Blake2b512, Digest};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ProtocolError, Result};

/// Size of a node ID in bytes (16 bytes / 128 bits)
pub const NODE_ID_SIZE: usize = 16;

/// A unique identifier for a node in the RelayMesh network
///
/// Derived from the node's public key, so a peer cannot claim an id it
/// does not hold the key for.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_SIZE]);

impl NodeId {
    /// Destination sentinel meaning "every node"
    pub const BROADCAST: NodeId = NodeId([0xFF; NODE_ID_SIZE]);

    /// Create a NodeId from a byte array
    pub fn from_bytes(bytes: [u8; NODE_ID_SIZE]) -> Self {
        NodeId(bytes)
    }

    /// Derive the id owned by a public key: BLAKE2b-512(key)[0..16]
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let hash = Blake2b512::digest(public_key);
        let mut id = [0u8; NODE_ID_SIZE];
        id.copy_from_slice(&hash[..NODE_ID_SIZE]);
        NodeId(id)
    }

    /// Get the bytes of this NodeId
    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| ProtocolError::InvalidNodeId(e.to_string()))?;

        if bytes.len() != NODE_ID_SIZE {
            return Err(ProtocolError::InvalidNodeId(format!(
                "expected {} bytes, got {}",
                NODE_ID_SIZE,
                bytes.len()
            )));
        }

        let mut arr = [0u8; NODE_ID_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(NodeId(arr))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            return write!(f, "broadcast");
        }
        write!(f, "{}", &self.to_hex()[..12])
    }
}

/// Message priority
///
/// Higher priorities get a larger hop budget; `Emergency` always floods
/// as far as the network allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Emergency,
}

impl Priority {
    pub fn level_name(&self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Emergency => "EMERGENCY",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level_name())
    }
}

/// Role a peer plays in the local mesh topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PeerRole {
    Coordinator,
    Relay,
    #[default]
    Node,
    Edge,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerRole::Coordinator => "coordinator",
            PeerRole::Relay => "relay",
            PeerRole::Node => "node",
            PeerRole::Edge => "edge",
        };
        write!(f, "{}", name)
    }
}
