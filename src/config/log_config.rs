use log::LevelFilter;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// One of `error`, `warn`, `info`, `debug`, `trace`, `off`
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
        }
    }
}

impl LogConfig {
    pub fn level_filter(&self) -> Option<LevelFilter> {
        self.level.parse().ok()
    }
}
