//! RelayMesh Protocol Module
//!
//! This module defines the packet model, the wire codec and the typed
//! payloads exchanged between RelayMesh nodes.

pub mod error;
pub mod frame;
pub mod packet;
pub mod payload;
pub mod types;

pub use error::{DecodeError, ProtocolError, Result};
pub use frame::{decode, encode};
pub use packet::{now_millis, Packet, PacketId, PacketKind};
pub use types::{NodeId, PeerRole, Priority};
