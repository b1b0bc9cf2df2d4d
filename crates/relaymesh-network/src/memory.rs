//! In-process transport
//!
//! A `MemoryHub` is a switchboard shared by any number of simulated nodes.
//! Links are created and cut explicitly, and sends over a link can be made
//! to fail so store-and-forward behaviour can be exercised.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use relaymesh_protocol::NodeId;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::transport::{EventSink, Transport, TransportEvent};

#[derive(Default)]
struct Slot {
    sink: Option<EventSink>,
    /// Neighbour -> link quality
    links: HashMap<NodeId, u8>,
    failing: HashSet<NodeId>,
    attempts: HashMap<NodeId, usize>,
    connects: HashMap<NodeId, usize>,
    delivered: Vec<(NodeId, Vec<u8>)>,
    shut_down: bool,
}

#[derive(Default)]
struct HubState {
    nodes: HashMap<NodeId, Slot>,
}

impl HubState {
    fn notify(&self, node: &NodeId, event: TransportEvent) {
        if let Some(sink) = self.nodes.get(node).and_then(|slot| slot.sink.as_ref()) {
            let _ = sink.send(event);
        }
    }
}

/// Shared switchboard for `MemoryTransport`s
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the transport endpoint for `node`
    pub async fn transport(&self, node: NodeId) -> MemoryTransport {
        self.state.lock().await.nodes.entry(node).or_default();
        MemoryTransport {
            local: node,
            state: self.state.clone(),
        }
    }

    /// Bring up a bidirectional link with the given quality (0..=5)
    pub async fn link(&self, a: NodeId, b: NodeId, quality: u8) {
        let quality = quality.min(5);
        let mut state = self.state.lock().await;
        let fresh = !state
            .nodes
            .get(&a)
            .is_some_and(|slot| slot.links.contains_key(&b));

        state.nodes.entry(a).or_default().links.insert(b, quality);
        state.nodes.entry(b).or_default().links.insert(a, quality);

        if fresh {
            debug!("memory link up: {} <-> {}", a, b);
            state.notify(&a, TransportEvent::PeerConnected { peer: b });
            state.notify(&b, TransportEvent::PeerConnected { peer: a });
        }
    }

    /// Cut a link; both ends see `PeerDisconnected`
    pub async fn unlink(&self, a: NodeId, b: NodeId) {
        let mut state = self.state.lock().await;
        let existed = state
            .nodes
            .get_mut(&a)
            .and_then(|slot| slot.links.remove(&b))
            .is_some();
        if let Some(slot) = state.nodes.get_mut(&b) {
            slot.links.remove(&a);
        }

        if existed {
            debug!("memory link down: {} <-> {}", a, b);
            state.notify(&a, TransportEvent::PeerDisconnected { peer: b });
            state.notify(&b, TransportEvent::PeerDisconnected { peer: a });
        }
    }

    /// Make sends from `from` to `to` fail (or succeed again)
    pub async fn set_failing(&self, from: NodeId, to: NodeId, failing: bool) {
        let mut state = self.state.lock().await;
        let slot = state.nodes.entry(from).or_default();
        if failing {
            slot.failing.insert(to);
        } else {
            slot.failing.remove(&to);
        }
    }

    /// Number of send attempts from `from` to `to`, successful or not
    pub async fn attempts(&self, from: NodeId, to: NodeId) -> usize {
        let state = self.state.lock().await;
        state
            .nodes
            .get(&from)
            .and_then(|slot| slot.attempts.get(&to).copied())
            .unwrap_or(0)
    }

    /// Number of `connect` calls from `from` to `to`
    pub async fn connects(&self, from: NodeId, to: NodeId) -> usize {
        let state = self.state.lock().await;
        state
            .nodes
            .get(&from)
            .and_then(|slot| slot.connects.get(&to).copied())
            .unwrap_or(0)
    }

    /// Frames successfully sent from `from` to `to`, in order
    pub async fn delivered(&self, from: NodeId, to: NodeId) -> Vec<Vec<u8>> {
        let state = self.state.lock().await;
        state
            .nodes
            .get(&from)
            .map(|slot| {
                slot.delivered
                    .iter()
                    .filter(|(peer, _)| *peer == to)
                    .map(|(_, bytes)| bytes.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop all recorded traffic
    pub async fn clear_records(&self) {
        let mut state = self.state.lock().await;
        for slot in state.nodes.values_mut() {
            slot.attempts.clear();
            slot.connects.clear();
            slot.delivered.clear();
        }
    }
}

/// One node's endpoint on a `MemoryHub`
pub struct MemoryTransport {
    local: NodeId,
    state: Arc<Mutex<HubState>>,
}

impl MemoryTransport {
    pub fn local_id(&self) -> NodeId {
        self.local
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, peer: &NodeId) -> Result<()> {
        let mut state = self.state.lock().await;
        let slot = state.nodes.entry(self.local).or_default();
        *slot.connects.entry(*peer).or_insert(0) += 1;
        if slot.links.contains_key(peer) {
            Ok(())
        } else {
            Err(TransportError::Unreachable(peer.to_hex()))
        }
    }

    async fn send(&self, peer: &NodeId, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock().await;
        let slot = state.nodes.entry(self.local).or_default();

        if slot.shut_down {
            return Err(TransportError::Shutdown);
        }
        if !slot.links.contains_key(peer) {
            return Err(TransportError::NotConnected(peer.to_hex()));
        }

        *slot.attempts.entry(*peer).or_insert(0) += 1;
        if slot.failing.contains(peer) {
            return Err(TransportError::SendFailed(format!(
                "injected failure towards {}",
                peer
            )));
        }
        slot.delivered.push((*peer, bytes.to_vec()));

        state.notify(
            peer,
            TransportEvent::Received {
                from: self.local,
                bytes: bytes.to_vec(),
            },
        );
        Ok(())
    }

    async fn register(&self, sink: EventSink) -> Result<()> {
        let mut state = self.state.lock().await;
        let slot = state.nodes.entry(self.local).or_default();
        if slot.sink.as_ref().is_some_and(|s| !s.is_closed()) {
            return Err(TransportError::AlreadyRegistered);
        }
        for peer in slot.links.keys() {
            let _ = sink.send(TransportEvent::PeerConnected { peer: *peer });
        }
        slot.sink = Some(sink);
        slot.shut_down = false;
        Ok(())
    }

    async fn signal_quality(&self, peer: &NodeId) -> u8 {
        let state = self.state.lock().await;
        state
            .nodes
            .get(&self.local)
            .and_then(|slot| slot.links.get(peer).copied())
            .unwrap_or(0)
    }

    async fn connected_peers(&self) -> Vec<NodeId> {
        let state = self.state.lock().await;
        let mut peers: Vec<NodeId> = state
            .nodes
            .get(&self.local)
            .map(|slot| slot.links.keys().copied().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    async fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(slot) = state.nodes.get_mut(&self.local) {
            slot.sink = None;
            slot.shut_down = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaymesh_protocol::types::NODE_ID_SIZE;
    use tokio::sync::mpsc;

    fn create_test_node_id(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; NODE_ID_SIZE])
    }

    #[tokio::test]
    async fn test_link_and_send() {
        let hub = MemoryHub::new();
        let a = hub.transport(create_test_node_id(1)).await;
        let b = hub.transport(create_test_node_id(2)).await;

        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        b.register(tx_b).await.unwrap();

        hub.link(a.local_id(), b.local_id(), 4).await;
        assert_eq!(
            rx_b.recv().await,
            Some(TransportEvent::PeerConnected { peer: a.local_id() })
        );

        a.send(&b.local_id(), b"ping").await.unwrap();
        assert_eq!(
            rx_b.recv().await,
            Some(TransportEvent::Received {
                from: a.local_id(),
                bytes: b"ping".to_vec()
            })
        );
        assert_eq!(a.signal_quality(&b.local_id()).await, 4);
        assert_eq!(a.connected_peers().await, vec![b.local_id()]);
    }

    #[tokio::test]
    async fn test_send_without_link_fails() {
        let hub = MemoryHub::new();
        let a = hub.transport(create_test_node_id(1)).await;
        let result = a.send(&create_test_node_id(2), b"x").await;
        assert!(matches!(result, Err(TransportError::NotConnected(_))));
        assert!(a.connect(&create_test_node_id(2)).await.is_err());
        assert_eq!(hub.connects(a.local_id(), create_test_node_id(2)).await, 1);
    }

    #[tokio::test]
    async fn test_injected_failure_counts_attempts() {
        let hub = MemoryHub::new();
        let a = hub.transport(create_test_node_id(1)).await;
        let _b = hub.transport(create_test_node_id(2)).await;
        hub.link(a.local_id(), create_test_node_id(2), 5).await;
        hub.set_failing(a.local_id(), create_test_node_id(2), true).await;

        assert!(a.send(&create_test_node_id(2), b"x").await.is_err());
        assert!(a.send(&create_test_node_id(2), b"y").await.is_err());
        assert_eq!(hub.attempts(a.local_id(), create_test_node_id(2)).await, 2);
        assert!(hub
            .delivered(a.local_id(), create_test_node_id(2))
            .await
            .is_empty());

        hub.set_failing(a.local_id(), create_test_node_id(2), false).await;
        a.send(&create_test_node_id(2), b"z").await.unwrap();
        assert_eq!(
            hub.delivered(a.local_id(), create_test_node_id(2)).await,
            vec![b"z".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_register_replays_existing_links() {
        let hub = MemoryHub::new();
        let a = hub.transport(create_test_node_id(1)).await;
        hub.link(a.local_id(), create_test_node_id(2), 3).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        a.register(tx).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::PeerConnected {
                peer: create_test_node_id(2)
            })
        );
    }

    #[tokio::test]
    async fn test_unlink_notifies_both_sides() {
        let hub = MemoryHub::new();
        let a = hub.transport(create_test_node_id(1)).await;
        let b = hub.transport(create_test_node_id(2)).await;
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        a.register(tx_a).await.unwrap();
        b.register(tx_b).await.unwrap();

        hub.link(a.local_id(), b.local_id(), 5).await;
        let _ = rx_a.recv().await;
        let _ = rx_b.recv().await;

        hub.unlink(a.local_id(), b.local_id()).await;
        assert_eq!(
            rx_a.recv().await,
            Some(TransportEvent::PeerDisconnected { peer: b.local_id() })
        );
        assert_eq!(
            rx_b.recv().await,
            Some(TransportEvent::PeerDisconnected { peer: a.local_id() })
        );
        assert!(a.connected_peers().await.is_empty());
    }
}
