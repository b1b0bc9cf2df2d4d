//! Persistence seam
//!
//! The router keeps its cache (identity, peers, routes, queue, chats) in a
//! key-value `Persistence` backend. `MemoryStore` is the in-process
//! implementation; the node crate provides a SQLite one.

use async_trait::async_trait;
use relaymesh_crypto::NodeIdentity;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{Result, RoutingError};

pub const KEY_IDENTITY: &str = "identity";
pub const KEY_PEERS: &str = "peers";
pub const KEY_ROUTES: &str = "routes";
pub const KEY_QUEUE: &str = "queue";
pub const KEY_CHATS: &str = "chats";

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Process-local store. Clones share the same data, which lets tests
/// "restart" a node on top of what the previous instance saved.
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RoutingError::Persistence(format!(
                "write to '{}' rejected",
                key
            )));
        }
        self.data
            .write()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.write().await.remove(key);
        Ok(())
    }
}

/// Serialize and store a record
pub async fn save_record<T: Serialize + ?Sized>(
    store: &dyn Persistence,
    key: &str,
    value: &T,
) -> Result<()> {
    let bytes =
        bincode::serialize(value).map_err(|e| RoutingError::Serialization(e.to_string()))?;
    store.set(key, &bytes).await
}

/// Load and deserialize a record
pub async fn load_record<T: DeserializeOwned>(
    store: &dyn Persistence,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(bytes) => bincode::deserialize(&bytes)
            .map(Some)
            .map_err(|e| RoutingError::Serialization(format!("{}: {}", key, e))),
        None => Ok(None),
    }
}

/// What to do when the stored identity cannot be read back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdentityRecovery {
    /// Replace it with a fresh identity (peers will see a new node)
    #[default]
    Regenerate,
    /// Refuse to start
    Refuse,
}

pub struct LoadedIdentity {
    pub identity: NodeIdentity,
    /// Set when a corrupt identity was replaced
    pub regenerated: bool,
}

/// Load the node identity, creating one on first run
pub async fn load_identity(
    store: &dyn Persistence,
    recovery: IdentityRecovery,
) -> Result<LoadedIdentity> {
    let stored = store.get(KEY_IDENTITY).await?;

    let (identity, regenerated) = match stored {
        None => {
            let identity = NodeIdentity::generate();
            info!("Generated new node identity {}", identity.node_id);
            (identity, false)
        }
        Some(bytes) => match NodeIdentity::from_bytes(&bytes) {
            Ok(identity) => return Ok(LoadedIdentity {
                identity,
                regenerated: false,
            }),
            Err(e) => match recovery {
                IdentityRecovery::Refuse => {
                    return Err(RoutingError::IdentityCorrupt(e.to_string()));
                }
                IdentityRecovery::Regenerate => {
                    let identity = NodeIdentity::generate();
                    warn!(
                        "Stored identity is corrupt ({}); regenerated as {}",
                        e, identity.node_id
                    );
                    (identity, true)
                }
            },
        },
    };

    store.set(KEY_IDENTITY, &identity.to_bytes()?).await?;
    Ok(LoadedIdentity {
        identity,
        regenerated,
    })
}
