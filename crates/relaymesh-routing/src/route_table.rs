//! Route table
//!
//! One entry per destination. An entry is usable while it is valid and
//! younger than the staleness window; invalidated entries are kept so the
//! UI can still show them.

use relaymesh_protocol::{NodeId, PacketId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub destination: NodeId,
    /// Intermediate hops from this node, nearest first
    pub path: Vec<NodeId>,
    /// Unix milliseconds
    pub discovered_at: u64,
    pub ttl_remaining_at_discovery: u8,
    /// Id of the route request this entry answers
    pub epoch: PacketId,
    pub valid: bool,
}

impl RouteEntry {
    pub fn next_hop(&self) -> Option<NodeId> {
        self.path.first().copied()
    }

    pub fn is_fresh(&self, now: u64, staleness_ms: u64) -> bool {
        self.valid && now.saturating_sub(self.discovered_at) < staleness_ms
    }

    fn passes_through(&self, peer: &NodeId) -> bool {
        self.path.contains(peer) || (self.path.is_empty() && self.destination == *peer)
    }
}

pub struct RouteTable {
    entries: HashMap<NodeId, RouteEntry>,
    staleness_ms: u64,
}

impl RouteTable {
    pub fn new(staleness_ms: u64) -> Self {
        RouteTable {
            entries: HashMap::new(),
            staleness_ms,
        }
    }

    /// A usable route to `destination`, if any
    pub fn lookup(&self, destination: &NodeId, now: u64) -> Option<&RouteEntry> {
        self.entries
            .get(destination)
            .filter(|entry| entry.is_fresh(now, self.staleness_ms))
    }

    /// The stored entry regardless of validity
    pub fn get(&self, destination: &NodeId) -> Option<&RouteEntry> {
        self.entries.get(destination)
    }

    /// Install a discovered route, replacing any previous path wholesale.
    ///
    /// Within a single request epoch the first (shortest so far) answer
    /// wins; a longer or equal answer to the same request is ignored.
    /// Returns whether the entry was installed.
    pub fn install(&mut self, entry: RouteEntry) -> bool {
        if let Some(existing) = self.entries.get(&entry.destination) {
            if existing.valid
                && existing.epoch == entry.epoch
                && existing.path.len() <= entry.path.len()
            {
                return false;
            }
        }
        self.entries.insert(entry.destination, entry);
        true
    }

    /// Invalidate every route that relies on `peer`; returns the affected
    /// destinations
    pub fn invalidate_via(&mut self, peer: &NodeId) -> Vec<NodeId> {
        let mut affected = Vec::new();
        for entry in self.entries.values_mut() {
            if entry.valid && entry.passes_through(peer) {
                entry.valid = false;
                affected.push(entry.destination);
            }
        }
        affected
    }

    pub fn entries(&self) -> Vec<RouteEntry> {
        let mut entries: Vec<RouteEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.destination.cmp(&b.destination));
        entries
    }

    pub fn restore(&mut self, entries: Vec<RouteEntry>) {
        for entry in entries {
            self.entries.insert(entry.destination, entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
