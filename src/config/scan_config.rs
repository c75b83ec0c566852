use serde::{Deserialize, Serialize};

use crate::core::bluetooth::SCAN_DURATION_MS;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Scan stops by itself after this many milliseconds
    pub duration_ms: u64,

    /// Discovery events weaker than this (dBm) are dropped
    pub min_rssi: Option<i16>,

    /// Case-insensitive substring the advertised name must contain
    pub name_filter: Option<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            duration_ms: SCAN_DURATION_MS,
            min_rssi: None,
            name_filter: None,
        }
    }
}
