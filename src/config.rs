//! Engine tunables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Normative defaults for the sync engine.
///
/// Deserializable from any serde format the embedding application chooses;
/// every field falls back to its default independently.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound on a single wire frame, header excluded.
    pub max_frame_bytes: usize,
    /// Transport keepalive ping interval in milliseconds; `None` disables
    /// keepalives (and with them stale-peer eviction).
    pub ping_interval_ms: Option<u64>,
    /// A connection with no traffic for this long is considered dead.
    pub dead_ms: u64,
    /// First client reconnect delay, in seconds.
    pub reconnect_min_secs: u64,
    /// Reconnect delay cap, in seconds.
    pub reconnect_max_secs: u64,
    /// Log every frame at debug level.
    pub verbose: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 1024 * 1024,
            ping_interval_ms: Some(20_000),
            dead_ms: 40_000,
            reconnect_min_secs: 2,
            reconnect_max_secs: 10,
            verbose: false,
        }
    }
}

impl SyncConfig {
    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval_ms.map(Duration::from_millis)
    }

    pub fn dead_interval(&self) -> Duration {
        Duration::from_millis(self.dead_ms)
    }
}
