//! Constants used throughout the application
//! This module contains the well-known GATT identifiers and the
//! timing values that drive scanning and reconnection.

use std::time::Duration;
use uuid::Uuid;

/// Standard Bluetooth Service UUIDs
pub const UUID_BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
pub const UUID_HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);

/// Standard Bluetooth Characteristic UUIDs
pub const UUID_BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);
pub const UUID_HEART_RATE_MEASUREMENT: Uuid =
    Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

/// Client Characteristic Configuration Descriptor
pub const UUID_CLIENT_CHARACTERISTIC_CONFIG: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// How long a scan runs before it is stopped automatically, in milliseconds
pub const SCAN_DURATION_MS: u64 = 10_000;

/// Fixed delay of the old single-shot manual reconnect, in milliseconds.
/// Superseded by [`RECONNECT_BACKOFF_MS`], kept for compatibility.
pub const RECONNECT_DELAY_MS: u64 = 3_000;

/// Backoff schedule for auto-reconnect. Attempts past the end reuse the last entry.
pub const RECONNECT_BACKOFF_MS: [u64; 5] = [1_000, 2_000, 4_000, 8_000, 15_000];

/// Maximum number of auto-reconnect attempts
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// How long a reconnect attempt waits for the session to reach `Connected`
pub const RECONNECT_CONFIRM_TIMEOUT_MS: u64 = 5_000;

/// Scan duration as a [`Duration`]
pub const fn scan_duration() -> Duration {
    Duration::from_millis(SCAN_DURATION_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuids_use_the_sig_base() {
        assert_eq!(
            UUID_BATTERY_SERVICE.to_string(),
            "0000180f-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            UUID_BATTERY_LEVEL.to_string(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            UUID_HEART_RATE_SERVICE.to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            UUID_HEART_RATE_MEASUREMENT.to_string(),
            "00002a37-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            UUID_CLIENT_CHARACTERISTIC_CONFIG.to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn backoff_table_matches_attempt_bound() {
        assert_eq!(RECONNECT_BACKOFF_MS.len() as u32, MAX_RECONNECT_ATTEMPTS);
        assert_eq!(scan_duration(), Duration::from_secs(10));
    }
}
