//! Packet deduplication window

use lru::LruCache;
use relaymesh_protocol::PacketId;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Default number of packet ids remembered
pub const DEFAULT_CAPACITY: usize = 1000;

/// Remembers recently seen packet ids
///
/// Bounded twice: by count (least recently seen ids fall out first) and
/// by age.
pub struct DeduplicationCache {
    seen: LruCache<PacketId, Instant>,
    ttl: Duration,
}

impl DeduplicationCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        DeduplicationCache {
            seen: LruCache::new(capacity),
            ttl,
        }
    }

    /// Whether `id` was seen within the window
    pub fn has_seen(&mut self, id: &PacketId) -> bool {
        match self.seen.peek(id) {
            Some(at) if at.elapsed() < self.ttl => true,
            Some(_) => {
                self.seen.pop(id);
                false
            }
            None => false,
        }
    }

    pub fn mark_seen(&mut self, id: PacketId) {
        self.seen.put(id, Instant::now());
    }

    /// Returns `true` the first time an id is offered within the window
    pub fn check_and_mark(&mut self, id: PacketId) -> bool {
        if self.has_seen(&id) {
            return false;
        }
        self.mark_seen(id);
        true
    }

    /// Drop ids older than the window
    pub fn cleanup_expired(&mut self) {
        while let Some((_, at)) = self.seen.peek_lru() {
            if at.elapsed() < self.ttl {
                break;
            }
            self.seen.pop_lru();
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
