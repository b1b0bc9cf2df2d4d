//! Power modes
//!
//! A power mode trades reach and responsiveness for battery: it fixes the
//! hop budget per priority and scales the retry and heartbeat intervals.

use relaymesh_protocol::Priority;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// How long an emergency broadcast keeps the node in emergency mode
pub const EMERGENCY_MODE_DURATION: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PowerMode {
    Performance,
    #[default]
    Balanced,
    BatterySaver,
    Emergency,
}

impl PowerMode {
    /// Hop budget for a message of the given priority
    pub fn ttl_for(&self, priority: Priority) -> u8 {
        // Columns: Low, Normal, High, Emergency
        let table: [u8; 4] = match self {
            PowerMode::Performance => [3, 7, 7, 10],
            PowerMode::Balanced => [3, 5, 5, 10],
            PowerMode::BatterySaver => [2, 3, 3, 10],
            PowerMode::Emergency => [5, 10, 10, 10],
        };
        match priority {
            Priority::Low => table[0],
            Priority::Normal => table[1],
            Priority::High => table[2],
            Priority::Emergency => table[3],
        }
    }

    /// Queue retry interval derived from the configured base
    pub fn retry_interval(&self, base: Duration) -> Duration {
        match self {
            PowerMode::Performance => base / 2,
            PowerMode::Balanced => base,
            PowerMode::BatterySaver => base * 3,
            PowerMode::Emergency => base / 4,
        }
    }

    /// Heartbeat interval derived from the configured base
    pub fn heartbeat_interval(&self, base: Duration) -> Duration {
        match self {
            PowerMode::Performance => base / 2,
            PowerMode::Balanced => base,
            PowerMode::BatterySaver => base * 3,
            PowerMode::Emergency => (base * 3) / 10,
        }
    }
}

impl fmt::Display for PowerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PowerMode::Performance => "performance",
            PowerMode::Balanced => "balanced",
            PowerMode::BatterySaver => "battery_saver",
            PowerMode::Emergency => "emergency",
        };
        write!(f, "{}", name)
    }
}
