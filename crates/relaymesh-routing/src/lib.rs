//! RelayMesh Packet Routing
//!
//! The store-and-forward core of a node:
//! - Peer registry and on-demand route discovery
//! - Flooded relay bounded by TTL and a deduplication window
//! - Per-destination FIFO delivery queue with retry and eviction
//! - Private, group and emergency chats
//! - Power modes that scale hop budgets and timers

pub mod chat;
pub mod dedup;
pub mod delivery_queue;
pub mod error;
pub mod events;
pub mod peer_registry;
pub mod policy;
pub mod route_table;
pub mod router;
pub mod store;

pub use chat::{Chat, ChatKind, Group, Message, MessageStatus};
pub use dedup::DeduplicationCache;
pub use delivery_queue::{DeliveryQueue, QueuedMessage};
pub use error::{Result, RoutingError};
pub use events::{MeshDensity, MeshEvent, NetworkStatus};
pub use peer_registry::{Peer, PeerRegistry, PeerUpdate};
pub use policy::PowerMode;
pub use route_table::{RouteEntry, RouteTable};
pub use router::{MessageHandle, Router, RouterConfig, RouterStats};
pub use store::{load_identity, IdentityRecovery, LoadedIdentity, MemoryStore, Persistence};
