use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning for server connections.
/// Persisted under the `client` key of the state document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSettings {
    /// Consecutive connect errors after which a server is deactivated
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    /// Delay collapsing bursts of config writes into one save
    #[serde(default = "default_save_debounce_ms")]
    pub save_debounce_ms: u64,
    /// Delay before re-checking whether the phase matches the config
    #[serde(default = "default_stale_debounce_ms")]
    pub stale_debounce_ms: u64,
    /// Per-attempt socket connect timeout
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Pause between socket connect attempts
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            error_threshold: default_error_threshold(),
            save_debounce_ms: default_save_debounce_ms(),
            stale_debounce_ms: default_stale_debounce_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl ClientSettings {
    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }

    pub fn stale_debounce(&self) -> Duration {
        Duration::from_millis(self.stale_debounce_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

fn default_error_threshold() -> u32 {
    5
}

fn default_save_debounce_ms() -> u64 {
    100
}

fn default_stale_debounce_ms() -> u64 {
    100
}

fn default_connect_timeout_ms() -> u64 {
    20_000
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}
