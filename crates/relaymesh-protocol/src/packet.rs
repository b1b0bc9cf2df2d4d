//! Packets: the unit the router decodes, relays and dispatches

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{DecodeError, ProtocolError, Result};
use crate::types::NodeId;

/// Size of a packet ID in bytes
pub const PACKET_ID_SIZE: usize = 16;

/// Globally unique packet identifier, preserved across relays
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct PacketId([u8; PACKET_ID_SIZE]);

impl PacketId {
    /// Generate a random packet ID
    pub fn generate() -> Self {
        let mut id = [0u8; PACKET_ID_SIZE];
        rand::thread_rng().fill_bytes(&mut id);
        PacketId(id)
    }

    pub fn from_bytes(bytes: [u8; PACKET_ID_SIZE]) -> Self {
        PacketId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PACKET_ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| ProtocolError::InvalidPacketId(e.to_string()))?;
        if bytes.len() != PACKET_ID_SIZE {
            return Err(ProtocolError::InvalidPacketId(format!(
                "expected {} bytes, got {}",
                PACKET_ID_SIZE,
                bytes.len()
            )));
        }
        let mut arr = [0u8; PACKET_ID_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(PacketId(arr))
    }
}

impl std::fmt::Debug for PacketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PacketId({}...)", &self.to_hex()[..12])
    }
}

impl std::fmt::Display for PacketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.to_hex()[..12])
    }
}

/// Packet kind enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketKind {
    /// User message (0x01)
    Message = 0x01,
    /// Identity announcement on link-up (0x02)
    Discovery = 0x02,
    /// Liveness beacon, never relayed (0x03)
    Heartbeat = 0x03,
    /// Flooded route query (0x04)
    RouteRequest = 0x04,
    /// Accumulated path back to the requester (0x05)
    RouteReply = 0x05,
    /// Delivery confirmation (0x06)
    Ack = 0x06,
}

impl PacketKind {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> std::result::Result<Self, DecodeError> {
        match value {
            0x01 => Ok(PacketKind::Message),
            0x02 => Ok(PacketKind::Discovery),
            0x03 => Ok(PacketKind::Heartbeat),
            0x04 => Ok(PacketKind::RouteRequest),
            0x05 => Ok(PacketKind::RouteReply),
            0x06 => Ok(PacketKind::Ack),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }
}

/// A packet as it travels the mesh
///
/// Packets are never mutated in place. Relaying produces a new value with
/// the same id, one less TTL and one more hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub id: PacketId,
    pub kind: PacketKind,
    pub source: NodeId,
    pub destination: NodeId,
    pub payload: Vec<u8>,
    pub ttl: u8,
    pub hops: u8,
    /// Unix timestamp in milliseconds
    pub created_at: u64,
}

impl Packet {
    /// Create a fresh packet with a random id
    pub fn new(
        kind: PacketKind,
        source: NodeId,
        destination: NodeId,
        payload: Vec<u8>,
        ttl: u8,
    ) -> Self {
        Self::with_id(PacketId::generate(), kind, source, destination, payload, ttl)
    }

    /// Create a packet reusing a known id (queued messages keep theirs)
    pub fn with_id(
        id: PacketId,
        kind: PacketKind,
        source: NodeId,
        destination: NodeId,
        payload: Vec<u8>,
        ttl: u8,
    ) -> Self {
        Packet {
            id,
            kind,
            source,
            destination,
            payload,
            ttl,
            hops: 0,
            created_at: now_millis(),
        }
    }

    /// The packet a relay forwards: same id, `ttl - 1`, `hops + 1`
    pub fn relayed(&self) -> Packet {
        Packet {
            ttl: self.ttl.saturating_sub(1),
            hops: self.hops.saturating_add(1),
            ..self.clone()
        }
    }

    /// A relay may only forward while hops remain after this one
    pub fn can_relay(&self) -> bool {
        self.ttl > 1
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination.is_broadcast()
    }
}

/// Current Unix time in milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NODE_ID_SIZE;

    fn node(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; NODE_ID_SIZE])
    }

    #[test]
    fn test_relayed_decrements_ttl_and_counts_hop() {
        let packet = Packet::new(PacketKind::Message, node(1), node(2), vec![1, 2, 3], 5);
        let relayed = packet.relayed();

        assert_eq!(relayed.id, packet.id);
        assert_eq!(relayed.ttl, 4);
        assert_eq!(relayed.hops, 1);
        assert_eq!(relayed.payload, packet.payload);
        // Original untouched
        assert_eq!(packet.ttl, 5);
        assert_eq!(packet.hops, 0);
    }

    #[test]
    fn test_ttl_never_increases_across_relays() {
        let mut packet = Packet::new(PacketKind::Message, node(1), node(2), vec![], 3);
        let mut last = packet.ttl;
        while packet.can_relay() {
            packet = packet.relayed();
            assert!(packet.ttl < last);
            last = packet.ttl;
        }
        assert_eq!(packet.ttl, 1);
        assert_eq!(packet.hops, 2);
    }

    #[test]
    fn test_kind_from_u8() {
        assert_eq!(PacketKind::from_u8(0x04).unwrap(), PacketKind::RouteRequest);
        assert_eq!(PacketKind::from_u8(0x42), Err(DecodeError::UnknownKind(0x42)));
    }

    #[test]
    fn test_packet_ids_are_unique() {
        assert_ne!(PacketId::generate(), PacketId::generate());
    }
}
