use anyhow::{Context, Result};
use relaymesh_network::udp::{UdpConfig, DEFAULT_PORT};
use relaymesh_protocol::{NodeId, PeerRole};
use relaymesh_routing::{IdentityRecovery, PowerMode, RouterConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(skip)]
    config_file_path: PathBuf,
    #[serde(skip)]
    pub data_directory: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    /// Announced role; left out, peers classify us by link quality
    #[serde(default)]
    pub role: Option<PeerRole>,
    #[serde(default)]
    pub identity_recovery: IdentityRecovery,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "relaymesh".to_string(),
            role: None,
            identity_recovery: IdentityRecovery::Regenerate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub power_mode: PowerMode,
    pub max_attempts: u32,
    pub max_age_secs: u64,
    pub retry_interval_secs: u64,
    pub route_staleness_secs: u64,
    pub emergency_duration_secs: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            power_mode: PowerMode::Balanced,
            max_attempts: 10,
            max_age_secs: 24 * 3600,
            retry_interval_secs: 60,
            route_staleness_secs: 600,
            emergency_duration_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    pub capacity: usize,
    pub window_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            window_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    /// Peers silent for longer are marked offline
    pub peer_timeout_secs: u64,
    /// Delay before redialling a lost relay or node peer
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            peer_timeout_secs: 60,
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file, relative to the data directory
    pub database: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("relaymesh.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub bind: SocketAddr,
    /// Hex node id -> UDP address
    #[serde(default)]
    pub peers: BTreeMap<String, SocketAddr>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            peers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(config_path: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);
        let data_dir = data_dir.unwrap_or_else(Self::default_data_dir);

        if !config_path.exists() {
            anyhow::bail!(
                "Configuration file not found: {}\nRun with --init to create a new configuration",
                config_path.display()
            );
        }

        let contents =
            fs::read_to_string(&config_path).context("Failed to read configuration file")?;

        let mut config: Config =
            serde_yaml::from_str(&contents).context("Failed to parse configuration file")?;

        config.config_file_path = config_path;
        config.data_directory = data_dir;

        Ok(config)
    }

    /// Create and save a new default configuration
    pub fn create_default(config_path: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);
        let data_dir = data_dir.unwrap_or_else(Self::default_data_dir);

        fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create {}", data_dir.display()))?;

        let config = Config {
            config_file_path: config_path,
            data_directory: data_dir,
            ..Default::default()
        };
        config.save()?;

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml::to_string(self)?;
        fs::write(&self.config_file_path, yaml).with_context(|| {
            format!("Failed to write {}", self.config_file_path.display())
        })?;
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_directory.join(&self.storage.database)
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            display_name: Some(self.node.name.clone()),
            role: self.node.role,
            dedup_capacity: self.dedup.capacity,
            dedup_window: Duration::from_secs(self.dedup.window_secs),
            max_attempts: self.routing.max_attempts,
            max_age: Duration::from_secs(self.routing.max_age_secs),
            route_staleness: Duration::from_secs(self.routing.route_staleness_secs),
            peer_timeout: Duration::from_secs(self.heartbeat.peer_timeout_secs),
            reconnect_delay: Duration::from_secs(self.heartbeat.reconnect_delay_secs),
            retry_interval: Duration::from_secs(self.routing.retry_interval_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat.interval_secs),
            power_mode: self.routing.power_mode,
            emergency_duration: Duration::from_secs(self.routing.emergency_duration_secs),
        }
    }

    pub fn udp_config(&self) -> Result<UdpConfig> {
        let mut peers = std::collections::HashMap::new();
        for (id, addr) in &self.transport.peers {
            let node_id = NodeId::from_hex(id)
                .with_context(|| format!("Invalid peer id in transport.peers: {}", id))?;
            peers.insert(node_id, *addr);
        }
        Ok(UdpConfig {
            bind_addr: self.transport.bind,
            peers,
        })
    }

    fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("relaymesh")
            .join("config.yaml")
    }

    fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("relaymesh")
    }
}
