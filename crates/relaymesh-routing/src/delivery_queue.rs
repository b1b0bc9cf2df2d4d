//! Store-and-forward delivery queue
//!
//! Messages that could not be sent wait here, FIFO per destination.
//! Broadcast messages queue under `NodeId::BROADCAST`.

use relaymesh_protocol::{NodeId, PacketId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::chat::Message;

/// Default maximum age of a queued message (24 hours)
pub const DEFAULT_MAX_AGE_MS: u64 = 24 * 3600 * 1000;

/// Default maximum delivery attempts
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub destination: NodeId,
    pub message: Message,
    /// Unix milliseconds
    pub enqueued_at: u64,
    pub attempts: u32,
}

#[derive(Debug, Default)]
pub struct DeliveryQueue {
    queues: HashMap<NodeId, VecDeque<QueuedMessage>>,
    ids: HashSet<PacketId>,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message; returns `false` if its id is already queued
    pub fn enqueue(&mut self, destination: NodeId, message: Message, now: u64) -> bool {
        if !self.ids.insert(message.id) {
            return false;
        }
        self.queues
            .entry(destination)
            .or_default()
            .push_back(QueuedMessage {
                destination,
                message,
                enqueued_at: now,
                attempts: 0,
            });
        true
    }

    pub fn front(&self, destination: &NodeId) -> Option<&QueuedMessage> {
        self.queues.get(destination).and_then(|q| q.front())
    }

    pub fn pop_front(&mut self, destination: &NodeId) -> Option<QueuedMessage> {
        let queue = self.queues.get_mut(destination)?;
        let entry = queue.pop_front()?;
        if queue.is_empty() {
            self.queues.remove(destination);
        }
        self.ids.remove(&entry.message.id);
        Some(entry)
    }

    /// Count a failed attempt against the head of a destination's queue
    pub fn record_failure(&mut self, destination: &NodeId) -> Option<u32> {
        let entry = self.queues.get_mut(destination)?.front_mut()?;
        entry.attempts += 1;
        Some(entry.attempts)
    }

    /// Remove entries that are too old or out of attempts
    pub fn evict(&mut self, now: u64, max_age_ms: u64, max_attempts: u32) -> Vec<QueuedMessage> {
        let mut evicted = Vec::new();
        for queue in self.queues.values_mut() {
            let mut kept = VecDeque::with_capacity(queue.len());
            for entry in queue.drain(..) {
                let too_old = now.saturating_sub(entry.enqueued_at) >= max_age_ms;
                if too_old || entry.attempts >= max_attempts {
                    evicted.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            *queue = kept;
        }
        self.queues.retain(|_, q| !q.is_empty());
        for entry in &evicted {
            self.ids.remove(&entry.message.id);
        }
        evicted
    }

    pub fn contains(&self, id: &PacketId) -> bool {
        self.ids.contains(id)
    }

    /// Destinations with pending messages
    pub fn destinations(&self) -> Vec<NodeId> {
        let mut destinations: Vec<NodeId> = self.queues.keys().copied().collect();
        destinations.sort();
        destinations
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Every entry, FIFO order within each destination
    pub fn entries(&self) -> Vec<QueuedMessage> {
        self.destinations()
            .iter()
            .filter_map(|d| self.queues.get(d))
            .flat_map(|q| q.iter().cloned())
            .collect()
    }

    pub fn restore(&mut self, entries: Vec<QueuedMessage>) {
        for entry in entries {
            if self.ids.insert(entry.message.id) {
                self.queues
                    .entry(entry.destination)
                    .or_default()
                    .push_back(entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::MessageStatus;
    use chrono::Utc;
    use relaymesh_protocol::payload::MessageKind;
    use relaymesh_protocol::types::NODE_ID_SIZE;
    use relaymesh_protocol::Priority;

    fn create_test_node_id(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; NODE_ID_SIZE])
    }

    fn message(content: &str) -> Message {
        Message {
            id: PacketId::generate(),
            chat_id: "chat_test".to_string(),
            sender: create_test_node_id(1),
            content: content.to_string(),
            status: MessageStatus::Queued,
            hops: 0,
            encrypted: false,
            priority: Priority::Normal,
            kind: MessageKind::Text,
            sent_at: Utc::now(),
        }
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let mut queue = DeliveryQueue::new();
        let dest = create_test_node_id(2);
        let msg = message("m1");
        assert!(queue.enqueue(dest, msg.clone(), 0));
        assert!(!queue.enqueue(dest, msg, 0));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = DeliveryQueue::new();
        let dest = create_test_node_id(2);
        for content in ["m1", "m2", "m3"] {
            queue.enqueue(dest, message(content), 0);
        }
        let order: Vec<String> = std::iter::from_fn(|| queue.pop_front(&dest))
            .map(|e| e.message.content)
            .collect();
        assert_eq!(order, vec!["m1", "m2", "m3"]);
        assert!(queue.is_empty());
        assert!(queue.destinations().is_empty());
    }

    #[test]
    fn test_record_failure_only_touches_head() {
        let mut queue = DeliveryQueue::new();
        let dest = create_test_node_id(2);
        queue.enqueue(dest, message("m1"), 0);
        queue.enqueue(dest, message("m2"), 0);

        assert_eq!(queue.record_failure(&dest), Some(1));
        assert_eq!(queue.record_failure(&dest), Some(2));
        let entries = queue.entries();
        assert_eq!(entries[0].attempts, 2);
        assert_eq!(entries[1].attempts, 0);
    }

    #[test]
    fn test_evict_by_age_and_attempts() {
        let mut queue = DeliveryQueue::new();
        let dest = create_test_node_id(2);
        queue.enqueue(dest, message("old"), 0);
        queue.enqueue(dest, message("tired"), 5_000);
        queue.enqueue(dest, message("fresh"), 5_000);

        // "old" is at the head; exhaust the second entry by hand
        let mut entries = queue.entries();
        entries[1].attempts = 3;
        let mut queue = DeliveryQueue::new();
        queue.restore(entries);

        let evicted = queue.evict(10_000, 8_000, 3);
        let names: Vec<&str> = evicted.iter().map(|e| e.message.content.as_str()).collect();
        assert_eq!(names, vec!["old", "tired"]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.front(&dest).unwrap().message.content, "fresh");
    }
}
