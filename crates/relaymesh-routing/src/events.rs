//! Events published to the UI

use relaymesh_protocol::NodeId;
use serde::{Deserialize, Serialize};

use crate::chat::{Chat, Group, Message};
use crate::peer_registry::Peer;
use crate::policy::PowerMode;

/// Channel capacity for event subscribers
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeshDensity {
    Sparse,
    Optimal,
    Dense,
}

impl MeshDensity {
    pub fn from_connected(connected: usize) -> Self {
        match connected {
            0..=2 => MeshDensity::Sparse,
            3..=9 => MeshDensity::Optimal,
            _ => MeshDensity::Dense,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub node_count: usize,
    pub connected_count: usize,
    /// Share of known peers currently online, 0..=100
    pub health_percent: u8,
    pub density: MeshDensity,
    pub emergency_mode: bool,
    pub battery_optimized: bool,
}

impl NetworkStatus {
    pub fn new(node_count: usize, connected_count: usize, mode: PowerMode) -> Self {
        let health_percent = if node_count == 0 {
            0
        } else {
            ((connected_count as f64 / node_count as f64) * 100.0).round() as u8
        };
        NetworkStatus {
            node_count,
            connected_count,
            health_percent,
            density: MeshDensity::from_connected(connected_count),
            emergency_mode: mode == PowerMode::Emergency,
            battery_optimized: mode == PowerMode::BatterySaver,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    PeerDiscovered(Peer),
    PeerUpdated(Peer),
    MessageReceived {
        chat_id: String,
        message: Message,
    },
    MessageStatusUpdated {
        chat_id: String,
        message: Message,
    },
    RouteDiscovered {
        destination: NodeId,
        path: Vec<NodeId>,
    },
    NetworkStatusChanged(NetworkStatus),
    ChatCreated(Chat),
    GroupCreated(Group),
    PowerModeChanged(PowerMode),
    IdentityRegenerated {
        node_id: NodeId,
    },
}
