//! Transport trait

use crate::error::Result;
use relaymesh_protocol::NodeId;
use tokio::sync::mpsc;

/// Something that happened on a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A frame arrived from a directly connected peer
    Received { from: NodeId, bytes: Vec<u8> },
    /// A link to `peer` came up
    PeerConnected { peer: NodeId },
    /// The link to `peer` went down
    PeerDisconnected { peer: NodeId },
}

/// Where a transport delivers its events
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// Transport trait
///
/// Implementations only move bytes between direct neighbours; multi-hop
/// forwarding is the router's job.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Bring up a link to a peer
    async fn connect(&self, peer: &NodeId) -> Result<()>;

    /// Send a frame to a directly connected peer
    async fn send(&self, peer: &NodeId, bytes: &[u8]) -> Result<()>;

    /// Install the inbound event sink. Called once, before any traffic.
    /// Links that are already up are reported as `PeerConnected`.
    async fn register(&self, sink: EventSink) -> Result<()>;

    /// Link quality to a peer on a 0..=5 scale (0 when not connected)
    async fn signal_quality(&self, peer: &NodeId) -> u8;

    /// Peers with a live link
    async fn connected_peers(&self) -> Vec<NodeId>;

    /// Release the transport
    async fn shutdown(&self) -> Result<()>;
}
