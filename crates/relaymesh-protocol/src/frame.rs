//! Wire codec for packets
//!
//! Frame Structure (66-byte header + payload), all integers big-endian:
//! - Magic (4 bytes): 0x524D5348 ("RMSH")
//! - Version (1 byte): Protocol version (0x01)
//! - Kind (1 byte): Packet kind
//! - TTL (1 byte): Remaining hop budget
//! - Hops (1 byte): Hops traversed so far
//! - Packet ID (16 bytes)
//! - Source Node ID (16 bytes)
//! - Dest Node ID (16 bytes)
//! - Created At (8 bytes): Unix timestamp in milliseconds
//! - Payload Length (2 bytes)
//! - Payload (variable)

use crate::error::{DecodeError, ProtocolError, Result};
use crate::packet::{Packet, PacketId, PacketKind, PACKET_ID_SIZE};
use crate::types::{NodeId, NODE_ID_SIZE};

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic bytes to identify RelayMesh frames: "RMSH"
pub const MAGIC_BYTES: [u8; 4] = [0x52, 0x4D, 0x53, 0x48];

/// Total header size: 4 + 1 + 1 + 1 + 1 + 16 + 16 + 16 + 8 + 2 = 66 bytes
pub const HEADER_SIZE: usize = 4 + 4 + PACKET_ID_SIZE + 2 * NODE_ID_SIZE + 8 + 2;

/// Maximum payload size
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Serialize a packet to its wire form
pub fn encode(packet: &Packet) -> Result<Vec<u8>> {
    if packet.payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: packet.payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mut bytes = Vec::with_capacity(HEADER_SIZE + packet.payload.len());

    bytes.extend_from_slice(&MAGIC_BYTES);
    bytes.push(PROTOCOL_VERSION);
    bytes.push(packet.kind.to_u8());
    bytes.push(packet.ttl);
    bytes.push(packet.hops);
    bytes.extend_from_slice(packet.id.as_bytes());
    bytes.extend_from_slice(packet.source.as_bytes());
    bytes.extend_from_slice(packet.destination.as_bytes());
    bytes.extend_from_slice(&packet.created_at.to_be_bytes());
    bytes.extend_from_slice(&(packet.payload.len() as u16).to_be_bytes());

    debug_assert_eq!(bytes.len(), HEADER_SIZE, "Header size mismatch");

    bytes.extend_from_slice(&packet.payload);
    Ok(bytes)
}

/// Parse a packet from received bytes
///
/// Returns `Malformed` for structural problems and `UnknownKind` when the
/// structure is sound but the kind byte is not one we understand.
pub fn decode(bytes: &[u8]) -> std::result::Result<Packet, DecodeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(DecodeError::Malformed(format!(
            "frame too short: {} bytes (header is {})",
            bytes.len(),
            HEADER_SIZE
        )));
    }

    let mut reader = Reader::new(bytes);

    let magic: [u8; 4] = reader.array()?;
    if magic != MAGIC_BYTES {
        return Err(DecodeError::Malformed("bad magic".to_string()));
    }

    let version = reader.u8()?;
    if version != PROTOCOL_VERSION {
        return Err(DecodeError::Malformed(format!(
            "unsupported protocol version: {}",
            version
        )));
    }

    let kind_byte = reader.u8()?;
    let ttl = reader.u8()?;
    let hops = reader.u8()?;
    let id = PacketId::from_bytes(reader.array()?);
    let source = NodeId::from_bytes(reader.array()?);
    let destination = NodeId::from_bytes(reader.array()?);
    let created_at = u64::from_be_bytes(reader.array()?);
    let payload_len = u16::from_be_bytes(reader.array()?) as usize;

    let payload = reader.rest();
    if payload.len() != payload_len {
        return Err(DecodeError::Malformed(format!(
            "payload length mismatch: header says {}, got {}",
            payload_len,
            payload.len()
        )));
    }

    let kind = PacketKind::from_u8(kind_byte)?;

    Ok(Packet {
        id,
        kind,
        source,
        destination,
        payload: payload.to_vec(),
        ttl,
        hops,
        created_at,
    })
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, offset: 0 }
    }

    fn take(&mut self, len: usize) -> std::result::Result<&'a [u8], DecodeError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| DecodeError::Malformed("unexpected end of frame".to_string()))?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u8(&mut self) -> std::result::Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> std::result::Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.bytes[self.offset..];
        self.offset = self.bytes.len();
        slice
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; NODE_ID_SIZE])
    }

    fn sample() -> Packet {
        let mut packet = Packet::new(
            PacketKind::RouteRequest,
            node(1),
            node(2),
            b"hello mesh".to_vec(),
            7,
        );
        packet.hops = 2;
        packet
    }

    #[test]
    fn test_header_size() {
        assert_eq!(HEADER_SIZE, 66);
    }

    #[test]
    fn test_encode_decode() {
        let packet = sample();
        let bytes = encode(&packet).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + packet.payload.len());
        assert_eq!(decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_decode_rejects_truncated_input() {
        let bytes = encode(&sample()).unwrap();
        for len in 0..bytes.len() {
            assert!(
                matches!(decode(&bytes[..len]), Err(DecodeError::Malformed(_))),
                "prefix of length {} should be malformed",
                len
            );
        }
    }

    #[test]
    fn test_decode_rejects_bad_magic_and_version() {
        let mut bytes = encode(&sample()).unwrap();
        bytes[0] = b'X';
        assert!(matches!(decode(&bytes), Err(DecodeError::Malformed(_))));

        let mut bytes = encode(&sample()).unwrap();
        bytes[4] = 9;
        assert!(matches!(decode(&bytes), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_decode_unknown_kind() {
        let mut bytes = encode(&sample()).unwrap();
        bytes[5] = 0x7F;
        assert_eq!(decode(&bytes), Err(DecodeError::UnknownKind(0x7F)));
    }

    #[test]
    fn test_decode_garbage_never_panics() {
        let mut seed: u32 = 0x1234_5678;
        for len in [0usize, 1, 10, 65, 66, 67, 200] {
            let bytes: Vec<u8> = (0..len)
                .map(|_| {
                    seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                    (seed >> 16) as u8
                })
                .collect();
            let _ = decode(&bytes);
        }
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let packet = Packet::new(
            PacketKind::Message,
            node(1),
            node(2),
            vec![0u8; MAX_PAYLOAD_SIZE + 1],
            3,
        );
        assert!(matches!(
            encode(&packet),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }
}
