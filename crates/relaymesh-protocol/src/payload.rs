//! Typed packet payloads
//!
//! Each packet kind carries a bincode-encoded payload struct.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::packet::PacketId;
use crate::types::{NodeId, PeerRole, Priority};

/// Size of an X25519 public key
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of a crypto_box nonce
pub const NONCE_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MessageKind {
    #[default]
    Text,
    Emergency,
}

/// Group descriptor carried by group messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub id: String,
    pub name: String,
    pub participants: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Plaintext, or ciphertext when `encrypted` is set
    pub content: Vec<u8>,
    pub nonce: Option<[u8; NONCE_SIZE]>,
    pub encrypted: bool,
    /// Sender's key, so the recipient can open the box without a prior
    /// exchange
    pub sender_public_key: Option<[u8; PUBLIC_KEY_SIZE]>,
    pub priority: Priority,
    pub kind: MessageKind,
    pub group: Option<GroupInfo>,
    pub sender_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    pub display_name: Option<String>,
    pub role: Option<PeerRole>,
    pub battery: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub battery: Option<u8>,
    pub node_count: u32,
}

/// Route query; the packet destination is the node being searched for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRequestPayload {
    /// Nodes the request has visited after the requester, in order
    pub path: Vec<NodeId>,
    /// Requester's key, so the target can encrypt replies to it
    pub origin_public_key: Option<[u8; PUBLIC_KEY_SIZE]>,
}

/// Route answer; the packet destination is the original requester
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteReplyPayload {
    pub target: NodeId,
    /// Intermediate hops from the requester towards `target`
    pub path: Vec<NodeId>,
    /// Id of the request being answered
    pub request_id: PacketId,
    /// Target's key when the answering node knows it
    pub target_public_key: Option<[u8; PUBLIC_KEY_SIZE]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    pub message_id: PacketId,
}

pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| ProtocolError::SerializationFailed(e.to_string()))
}

pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| ProtocolError::DeserializationFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NODE_ID_SIZE;

    #[test]
    fn test_route_reply_payload() {
        let payload = RouteReplyPayload {
            target: NodeId::from_bytes([3; NODE_ID_SIZE]),
            path: vec![NodeId::from_bytes([2; NODE_ID_SIZE])],
            request_id: PacketId::generate(),
            target_public_key: Some([5; PUBLIC_KEY_SIZE]),
        };
        let bytes = encode_payload(&payload).unwrap();
        let decoded: RouteReplyPayload = decode_payload(&bytes).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_decode_payload_garbage() {
        let result: Result<DiscoveryPayload> = decode_payload(&[1, 2, 3]);
        assert!(matches!(result, Err(ProtocolError::DeserializationFailed(_))));
    }
}
