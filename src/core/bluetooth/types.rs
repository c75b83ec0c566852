//! Defines shared data structures for the Bluetooth module.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Represents a discovered Bluetooth device
#[derive(Debug, Clone, Serialize)]
pub struct BleDevice {
    /// Platform-stable identifier (MAC address on Android/Linux/Windows, UUID string on Apple platforms)
    pub id: String,
    /// The advertised name of the device, if available
    pub name: Option<String>,
    /// The signal strength (RSSI) in dBm
    pub rssi: i16,
}

impl BleDevice {
    /// Creates a new BleDevice instance
    pub fn new(id: impl Into<String>, name: Option<String>, rssi: i16) -> Self {
        Self {
            id: id.into(),
            name,
            rssi,
        }
    }

    /// Name for logs and error messages, falling back to the identifier.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

// Devices are the same device when their identifiers match, whatever the last name/RSSI was.
impl PartialEq for BleDevice {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for BleDevice {}

impl Hash for BleDevice {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Connection lifecycle of the single GATT session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(tag = "state", content = "data")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting(BleDevice),
    Connected(BleDevice),
    Error(String),
}

impl ConnectionState {
    /// The device being acted on, for `Connecting` and `Connected`.
    pub fn device(&self) -> Option<&BleDevice> {
        match self {
            Self::Connecting(device) | Self::Connected(device) => Some(device),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }

    /// True while a session is in flight or live; a new connect is rejected in these states.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Connecting(_) | Self::Connected(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting(device) => write!(f, "Connecting to {}", device.display_name()),
            Self::Connected(device) => write!(f, "Connected to {}", device.display_name()),
            Self::Error(message) => write!(f, "Error: {}", message),
        }
    }
}

/// Battery reading from the Battery Service (0x180F / 0x2A19)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatteryLevel {
    /// Battery level as a percentage (0-100)
    pub percentage: u8,
    pub timestamp: DateTime<Utc>,
}

impl BatteryLevel {
    pub fn new(percentage: u8) -> Self {
        Self {
            percentage,
            timestamp: Utc::now(),
        }
    }
}

/// Heart rate measurement from the Heart Rate Service (0x180D / 0x2A37)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartRate {
    pub beats_per_minute: u16,
    pub timestamp: DateTime<Utc>,
    /// Skin contact, `None` when the sensor does not report contact status
    pub sensor_contact: Option<bool>,
}

impl HeartRate {
    pub fn new(beats_per_minute: u16, sensor_contact: Option<bool>) -> Self {
        Self {
            beats_per_minute,
            timestamp: Utc::now(),
            sensor_contact,
        }
    }
}

/// Everything known about the connected device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub device: BleDevice,
    pub battery_level: Option<BatteryLevel>,
    pub heart_rate: Option<HeartRate>,
    /// Other characteristic values, hex encoded, keyed by characteristic UUID
    pub custom_data: HashMap<String, String>,
}

impl DeviceInfo {
    pub fn new(device: BleDevice) -> Self {
        Self {
            device,
            battery_level: None,
            heart_rate: None,
            custom_data: HashMap::new(),
        }
    }

    /// Returns a copy with the battery replaced and everything else kept.
    pub fn with_battery(mut self, battery_level: BatteryLevel) -> Self {
        self.battery_level = Some(battery_level);
        self
    }

    /// Returns a copy with the heart rate replaced and everything else kept.
    pub fn with_heart_rate(mut self, heart_rate: HeartRate) -> Self {
        self.heart_rate = Some(heart_rate);
        self
    }

    pub fn with_custom_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_data.insert(key.into(), value.into());
        self
    }
}

/// Progress of the auto-reconnect loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(tag = "state")]
pub enum ReconnectState {
    #[default]
    Idle,
    Reconnecting {
        device: BleDevice,
        attempt: u32,
        max_attempts: u32,
    },
    Success {
        device: BleDevice,
    },
    Failed {
        device: BleDevice,
        reason: String,
    },
}

/// Power/authorization state of the local Bluetooth radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum RadioState {
    #[default]
    Unknown,
    PoweredOff,
    PoweredOn,
    Unauthorized,
}
