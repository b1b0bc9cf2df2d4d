//! RelayMesh Node
//!
//! Runs the routing engine as a long-lived task behind a `NodeHandle`, with
//! YAML configuration and a SQLite cache for the daemon binary.

pub mod config;
pub mod error;
pub mod node;
pub mod storage;

pub use config::Config;
pub use error::{NodeError, Result};
pub use node::{Node, NodeHandle};
pub use storage::SqliteStore;
