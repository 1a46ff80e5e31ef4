//! Node configuration

use concord_protocol::MAX_FRAME_SIZE;
use serde::Deserialize;
use std::time::Duration;

/// Default pub/sub topic for forum ops
pub const DEFAULT_TOPIC: &str = "concord-forum";

/// Upper bound on any requested page size
pub const MAX_BATCH_SIZE: usize = 500;

/// Anti-entropy settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between reconciliation cycles
    pub interval_secs: u64,
    /// Digests requested per page
    pub batch_size: usize,
    pub request_timeout_ms: u64,
    pub fetch_timeout_ms: u64,
    /// Body fetches allowed per received page
    pub fetch_budget: usize,
    /// How far below a peer's high-water mark the next cycle restarts
    pub lamport_rewind: u64,
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Page size clamped to `1..=MAX_BATCH_SIZE`
    pub fn page_size(&self) -> usize {
        self.batch_size.clamp(1, MAX_BATCH_SIZE)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 12,
            batch_size: 200,
            request_timeout_ms: 5_000,
            fetch_timeout_ms: 5_000,
            fetch_budget: 16,
            lamport_rewind: 10_000,
        }
    }
}

/// Inbound abuse limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_frame_bytes: usize,
    /// Frames per second per peer (0 = unlimited)
    pub rate_per_sec: u32,
    /// Bucket size; defaults to twice the rate
    pub burst: Option<u32>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: MAX_FRAME_SIZE,
            rate_per_sec: 0,
            burst: None,
        }
    }
}

/// Everything a node needs beyond its replica and transport
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub topic: String,
    pub sync: SyncConfig,
    pub limits: LimitsConfig,
    /// Actors whose shadow bans and policy updates are honored
    pub trusted_admins: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            sync: SyncConfig::default(),
            limits: LimitsConfig::default(),
            trusted_admins: Vec::new(),
        }
    }
}
