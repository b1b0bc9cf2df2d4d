//! Peer registry
//!
//! Every node this node has heard of. Peers are never removed, only marked
//! offline, so route hints and display names survive short disconnects.

use chrono::{DateTime, Duration, Utc};
use relaymesh_protocol::{NodeId, PeerRole};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Highest signal quality value
pub const MAX_SIGNAL_QUALITY: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: NodeId,
    pub display_name: Option<String>,
    pub public_key: Option<[u8; 32]>,
    pub last_seen_at: DateTime<Utc>,
    pub is_online: bool,
    /// 0..=5
    pub signal_quality: u8,
    pub role: PeerRole,
    /// 0..=100
    pub battery_hint: Option<u8>,
}

/// Partial peer information; `None` fields leave the stored value alone
#[derive(Debug, Clone, Default)]
pub struct PeerUpdate {
    pub id: Option<NodeId>,
    pub display_name: Option<String>,
    pub public_key: Option<[u8; 32]>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub is_online: Option<bool>,
    pub signal_quality: Option<u8>,
    pub role: Option<PeerRole>,
    pub battery_hint: Option<u8>,
}

impl PeerUpdate {
    /// An update that only says "this peer is alive right now"
    pub fn seen(id: NodeId, now: DateTime<Utc>) -> Self {
        PeerUpdate {
            id: Some(id),
            last_seen_at: Some(now),
            is_online: Some(true),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Discovered(Peer),
    Updated(Peer),
}

impl UpsertOutcome {
    pub fn peer(&self) -> &Peer {
        match self {
            UpsertOutcome::Discovered(peer) | UpsertOutcome::Updated(peer) => peer,
        }
    }
}

/// Role a peer gets from its link quality when first discovered
pub fn classify_role(signal_quality: u8) -> PeerRole {
    match signal_quality {
        4.. => PeerRole::Relay,
        2..=3 => PeerRole::Node,
        _ => PeerRole::Edge,
    }
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<NodeId, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an update into the registry
    ///
    /// Returns `None` when the update carries no id.
    pub fn upsert(&mut self, update: PeerUpdate, now: DateTime<Utc>) -> Option<UpsertOutcome> {
        let id = update.id?;
        let signal_quality = update.signal_quality.map(|q| q.min(MAX_SIGNAL_QUALITY));

        match self.peers.get_mut(&id) {
            Some(peer) => {
                if let Some(name) = update.display_name {
                    peer.display_name = Some(name);
                }
                if let Some(key) = update.public_key {
                    peer.public_key = Some(key);
                }
                if let Some(seen) = update.last_seen_at {
                    peer.last_seen_at = peer.last_seen_at.max(seen);
                }
                if let Some(online) = update.is_online {
                    peer.is_online = online;
                }
                if let Some(quality) = signal_quality {
                    peer.signal_quality = quality;
                }
                if let Some(role) = update.role {
                    peer.role = role;
                }
                if let Some(battery) = update.battery_hint {
                    peer.battery_hint = Some(battery.min(100));
                }
                Some(UpsertOutcome::Updated(peer.clone()))
            }
            None => {
                let signal_quality = signal_quality.unwrap_or(0);
                let peer = Peer {
                    id,
                    display_name: update.display_name,
                    public_key: update.public_key,
                    last_seen_at: update.last_seen_at.unwrap_or(now),
                    is_online: update.is_online.unwrap_or(true),
                    signal_quality,
                    role: update.role.unwrap_or_else(|| classify_role(signal_quality)),
                    battery_hint: update.battery_hint.map(|b| b.min(100)),
                };
                self.peers.insert(id, peer.clone());
                Some(UpsertOutcome::Discovered(peer))
            }
        }
    }

    /// Mark a peer offline; returns the updated record if it was known
    pub fn mark_offline(&mut self, id: &NodeId, now: DateTime<Utc>) -> Option<Peer> {
        let peer = self.peers.get_mut(id)?;
        peer.is_online = false;
        peer.last_seen_at = peer.last_seen_at.max(now);
        Some(peer.clone())
    }

    /// Mark online peers silent for longer than `timeout` offline
    pub fn expire_silent(&mut self, timeout: Duration, now: DateTime<Utc>) -> Vec<Peer> {
        let mut expired = Vec::new();
        for peer in self.peers.values_mut() {
            if peer.is_online && now - peer.last_seen_at > timeout {
                peer.is_online = false;
                expired.push(peer.clone());
            }
        }
        expired
    }

    pub fn get(&self, id: &NodeId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.peers.contains_key(id)
    }

    /// All peers, online first, then by id
    pub fn all(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| b.is_online.cmp(&a.is_online).then(a.id.cmp(&b.id)));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn online_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_online).count()
    }

    /// Load persisted peers; nobody is online until we hear from them
    pub fn restore(&mut self, peers: Vec<Peer>) {
        for mut peer in peers {
            peer.is_online = false;
            self.peers.insert(peer.id, peer);
        }
    }
}
