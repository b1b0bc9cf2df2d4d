//! RelayMesh Network Module
//!
//! The link-layer seam of a node: a `Transport` moves opaque byte frames to
//! directly connected peers and reports link changes. Two transports ship
//! with the crate:
//!
//! - `MemoryHub` / `MemoryTransport`: in-process links with failure
//!   injection, used to simulate meshes
//! - `UdpTransport`: datagrams to a static list of peer addresses

pub mod error;
pub mod memory;
pub mod transport;
pub mod udp;

pub use error::{Result, TransportError};
pub use memory::{MemoryHub, MemoryTransport};
pub use transport::{EventSink, Transport, TransportEvent};
pub use udp::{UdpConfig, UdpTransport};
