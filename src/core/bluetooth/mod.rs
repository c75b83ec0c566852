//! Bluetooth functionality
//! Scanning, the single GATT session, characteristic decoding hand-off and
//! auto-reconnect. The manager talks to the radio through [`PlatformAdapter`],
//! implemented on `bluest` for real hardware and by [`SimulatedAdapter`].

mod adapter;
mod connection;
mod constants;
mod device;
mod error;
mod manager;
mod notification;
mod reconnect;
mod scanner;
mod simulated;
mod types;

// Re-export types that should be publicly accessible
pub use adapter::{event_channel, AdapterEvent, AdapterEventReceiver, AdapterEventSender, PlatformAdapter};
pub use connection::BluestAdapter;
pub use constants::*; // Re-export all constants
pub use device::{filter_by_min_rssi, filter_by_name, matches_scan_filter, sort_by_signal_strength, upsert_device};
pub use error::BleError;
pub use manager::{ConnectionManager, ManagerConfig};
pub use reconnect::{AutoReconnectManager, ReconnectPolicy};
pub use simulated::{AdapterCall, SimulatedAdapter, SimulatedPeripheral};
pub use types::{BatteryLevel, BleDevice, ConnectionState, DeviceInfo, HeartRate, RadioState, ReconnectState};
