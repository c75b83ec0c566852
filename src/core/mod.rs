//! Core functionality
//! BLE session management and the characteristic decoders it relies on.

pub mod bluetooth;
pub mod decoder;

// Re-export commonly used types
pub use bluetooth::ConnectionManager;
pub use decoder::{parse_battery_level, parse_heart_rate, HeartRateMeasurement};
