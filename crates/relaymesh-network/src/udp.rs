//! UDP transport
//!
//! Links to a static set of peers whose addresses come from configuration.
//! Every datagram starts with a one-byte tag and the sender's node id:
//!
//! - `HELLO`: link-up announcement, answered once with a `HELLO`
//! - `DATA`: a router frame follows
//! - `BYE`: the sender is shutting down
//!
//! Datagrams from addresses that do not match the claimed sender's
//! configured address are dropped.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use relaymesh_protocol::types::NODE_ID_SIZE;
use relaymesh_protocol::NodeId;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::transport::{EventSink, Transport, TransportEvent};

/// Default UDP port for RelayMesh
pub const DEFAULT_PORT: u16 = 4101;

/// Maximum UDP payload we are willing to send
pub const MAX_UDP_SIZE: usize = 1400;

const TAG_HELLO: u8 = 0x01;
const TAG_DATA: u8 = 0x02;
const TAG_BYE: u8 = 0x03;
const PREFIX_SIZE: usize = 1 + NODE_ID_SIZE;

/// UDP transport configuration
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Local bind address
    pub bind_addr: SocketAddr,

    /// Known peers and where to reach them
    pub peers: HashMap<NodeId, SocketAddr>,
}

impl Default for UdpConfig {
    fn default() -> Self {
        UdpConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            peers: HashMap::new(),
        }
    }
}

struct Shared {
    local: NodeId,
    socket: UdpSocket,
    peers: RwLock<HashMap<NodeId, SocketAddr>>,
    connected: RwLock<HashSet<NodeId>>,
    sink: RwLock<Option<EventSink>>,
}

impl Shared {
    fn datagram(&self, tag: u8, body: &[u8]) -> Vec<u8> {
        let mut datagram = Vec::with_capacity(PREFIX_SIZE + body.len());
        datagram.push(tag);
        datagram.extend_from_slice(self.local.as_bytes());
        datagram.extend_from_slice(body);
        datagram
    }

    async fn send_tagged(&self, peer: &NodeId, tag: u8, body: &[u8]) -> Result<()> {
        let addr = self
            .peers
            .read()
            .await
            .get(peer)
            .copied()
            .ok_or_else(|| TransportError::Unreachable(peer.to_hex()))?;
        let datagram = self.datagram(tag, body);
        if datagram.len() > MAX_UDP_SIZE {
            return Err(TransportError::DatagramTooLarge {
                size: datagram.len(),
                max: MAX_UDP_SIZE,
            });
        }
        self.socket
            .send_to(&datagram, addr)
            .await
            .map_err(|e| TransportError::SendFailed(format!("UDP send failed: {}", e)))?;
        Ok(())
    }

    async fn emit(&self, event: TransportEvent) {
        if let Some(sink) = self.sink.read().await.as_ref() {
            let _ = sink.send(event);
        }
    }

    /// Mark a peer connected; returns true if it was not already
    async fn mark_connected(&self, peer: NodeId) -> bool {
        let inserted = self.connected.write().await.insert(peer);
        if inserted {
            info!("UDP link up: {}", peer);
            self.emit(TransportEvent::PeerConnected { peer }).await;
        }
        inserted
    }

    async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        if datagram.len() < PREFIX_SIZE {
            debug!("Dropping short datagram from {}", from);
            return;
        }

        let mut id = [0u8; NODE_ID_SIZE];
        id.copy_from_slice(&datagram[1..PREFIX_SIZE]);
        let sender = NodeId::from_bytes(id);

        if self.peers.read().await.get(&sender) != Some(&from) {
            warn!("Dropping datagram from {} claiming to be {}", from, sender);
            return;
        }

        match datagram[0] {
            TAG_HELLO => {
                if self.mark_connected(sender).await {
                    if let Err(e) = self.send_tagged(&sender, TAG_HELLO, &[]).await {
                        warn!("Failed to answer hello from {}: {}", sender, e);
                    }
                }
            }
            TAG_DATA => {
                self.mark_connected(sender).await;
                self.emit(TransportEvent::Received {
                    from: sender,
                    bytes: datagram[PREFIX_SIZE..].to_vec(),
                })
                .await;
            }
            TAG_BYE => {
                if self.connected.write().await.remove(&sender) {
                    info!("UDP link down: {}", sender);
                    self.emit(TransportEvent::PeerDisconnected { peer: sender })
                        .await;
                }
            }
            other => debug!("Unknown datagram tag {:#04x} from {}", other, from),
        }
    }
}

/// UDP transport over a static peer list
pub struct UdpTransport {
    shared: Arc<Shared>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Bind the local socket
    pub async fn bind(local: NodeId, config: UdpConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr).await.map_err(|e| {
            TransportError::InitializationFailed(format!(
                "Failed to bind UDP socket on {}: {}",
                config.bind_addr, e
            ))
        })?;

        info!(
            "UDP transport bound on {} with {} configured peers",
            socket.local_addr()?,
            config.peers.len()
        );

        Ok(UdpTransport {
            shared: Arc::new(Shared {
                local,
                socket,
                peers: RwLock::new(config.peers),
                connected: RwLock::new(HashSet::new()),
                sink: RwLock::new(None),
            }),
            recv_task: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.shared.socket.local_addr()?)
    }

    /// Add or update a peer address
    pub async fn add_peer(&self, peer: NodeId, addr: SocketAddr) {
        self.shared.peers.write().await.insert(peer, addr);
    }

    /// Say hello to every configured peer
    pub async fn connect_all(&self) {
        let peers: Vec<NodeId> = self.shared.peers.read().await.keys().copied().collect();
        for peer in peers {
            if let Err(e) = self.connect(&peer).await {
                warn!("Failed to connect to {}: {}", peer, e);
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn connect(&self, peer: &NodeId) -> Result<()> {
        self.shared.send_tagged(peer, TAG_HELLO, &[]).await?;
        self.shared.mark_connected(*peer).await;
        Ok(())
    }

    async fn send(&self, peer: &NodeId, bytes: &[u8]) -> Result<()> {
        if !self.shared.connected.read().await.contains(peer) {
            return Err(TransportError::NotConnected(peer.to_hex()));
        }
        self.shared.send_tagged(peer, TAG_DATA, bytes).await
    }

    async fn register(&self, sink: EventSink) -> Result<()> {
        {
            let mut slot = self.shared.sink.write().await;
            if slot.is_some() {
                return Err(TransportError::AlreadyRegistered);
            }
            for peer in self.shared.connected.read().await.iter() {
                let _ = sink.send(TransportEvent::PeerConnected { peer: *peer });
            }
            *slot = Some(sink);
        }

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_UDP_SIZE + PREFIX_SIZE];
            loop {
                match shared.socket.recv_from(&mut buf).await {
                    Ok((size, from)) => shared.handle_datagram(&buf[..size], from).await,
                    Err(e) => {
                        warn!("UDP receive failed: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        });
        *self.recv_task.lock().await = Some(handle);
        Ok(())
    }

    async fn signal_quality(&self, peer: &NodeId) -> u8 {
        // Wired links are either up or down
        if self.shared.connected.read().await.contains(peer) {
            5
        } else {
            0
        }
    }

    async fn connected_peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self.shared.connected.read().await.iter().copied().collect();
        peers.sort();
        peers
    }

    async fn shutdown(&self) -> Result<()> {
        let peers: Vec<NodeId> = self.shared.connected.write().await.drain().collect();
        for peer in peers {
            if let Err(e) = self.shared.send_tagged(&peer, TAG_BYE, &[]).await {
                debug!("Failed to say goodbye to {}: {}", peer, e);
            }
        }
        if let Some(handle) = self.recv_task.lock().await.take() {
            handle.abort();
        }
        *self.shared.sink.write().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    fn create_test_node_id(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; NODE_ID_SIZE])
    }

    async fn pair() -> (UdpTransport, UdpTransport) {
        let loopback = SocketAddr::from(([127, 0, 0, 1], 0));
        let config = UdpConfig {
            bind_addr: loopback,
            peers: HashMap::new(),
        };
        let a = UdpTransport::bind(create_test_node_id(1), config.clone())
            .await
            .unwrap();
        let b = UdpTransport::bind(create_test_node_id(2), config)
            .await
            .unwrap();
        a.add_peer(create_test_node_id(2), b.local_addr().unwrap())
            .await;
        b.add_peer(create_test_node_id(1), a.local_addr().unwrap())
            .await;
        (a, b)
    }

    #[tokio::test]
    async fn test_hello_and_data() {
        let (a, b) = pair().await;
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        a.register(tx_a).await.unwrap();
        b.register(tx_b).await.unwrap();

        a.connect(&create_test_node_id(2)).await.unwrap();
        let event = timeout(Duration::from_secs(2), rx_b.recv()).await.unwrap();
        assert_eq!(
            event,
            Some(TransportEvent::PeerConnected {
                peer: create_test_node_id(1)
            })
        );

        a.send(&create_test_node_id(2), b"frame").await.unwrap();
        let event = timeout(Duration::from_secs(2), rx_b.recv()).await.unwrap();
        assert_eq!(
            event,
            Some(TransportEvent::Received {
                from: create_test_node_id(1),
                bytes: b"frame".to_vec()
            })
        );
        assert_eq!(a.signal_quality(&create_test_node_id(2)).await, 5);
    }

    #[tokio::test]
    async fn test_send_requires_link() {
        let (a, _b) = pair().await;
        let result = a.send(&create_test_node_id(2), b"frame").await;
        assert!(matches!(result, Err(TransportError::NotConnected(_))));
    }
}
