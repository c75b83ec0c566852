use serde::{Deserialize, Serialize};

use crate::core::bluetooth::{
    MAX_RECONNECT_ATTEMPTS, RECONNECT_BACKOFF_MS, RECONNECT_CONFIRM_TIMEOUT_MS,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Start the auto-reconnect loop after an unexpected drop
    pub enabled: bool,

    /// Delay before each attempt (ms). The last entry repeats if there are
    /// more attempts than entries.
    pub backoff_ms: Vec<u64>,

    pub max_attempts: u32,

    /// How long one attempt waits for the link to come up (ms)
    pub confirm_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            enabled: true,
            backoff_ms: RECONNECT_BACKOFF_MS.to_vec(),
            max_attempts: MAX_RECONNECT_ATTEMPTS,
            confirm_timeout_ms: RECONNECT_CONFIRM_TIMEOUT_MS,
        }
    }
}
