//! Helpers over lists of discovered devices

use crate::core::bluetooth::types::BleDevice;

/// Inserts `device`, replacing any entry with the same identifier.
/// Returns true when the list changed.
pub fn upsert_device(devices: &mut Vec<BleDevice>, device: BleDevice) -> bool {
    match devices.iter_mut().find(|d| d.id == device.id) {
        Some(existing) => {
            if existing.name == device.name && existing.rssi == device.rssi {
                return false;
            }
            *existing = device;
        }
        None => devices.push(device),
    }
    true
}

/// Keeps devices whose name contains `pattern`, ignoring case. A blank pattern keeps everything.
pub fn filter_by_name(devices: &[BleDevice], pattern: &str) -> Vec<BleDevice> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return devices.to_vec();
    }
    let pattern = pattern.to_lowercase();
    devices
        .iter()
        .filter(|d| {
            d.name
                .as_ref()
                .map(|name| name.to_lowercase().contains(&pattern))
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// Keeps devices at or above `min_rssi` dBm.
pub fn filter_by_min_rssi(devices: &[BleDevice], min_rssi: i16) -> Vec<BleDevice> {
    devices
        .iter()
        .filter(|d| d.rssi >= min_rssi)
        .cloned()
        .collect()
}

/// Strongest signal first.
pub fn sort_by_signal_strength(devices: &[BleDevice]) -> Vec<BleDevice> {
    let mut sorted = devices.to_vec();
    sorted.sort_by(|a, b| b.rssi.cmp(&a.rssi));
    sorted
}

/// Whether a discovery event passes the configured scan filters.
pub fn matches_scan_filter(
    device: &BleDevice,
    min_rssi: Option<i16>,
    name_filter: Option<&str>,
) -> bool {
    if let Some(min) = min_rssi {
        if device.rssi < min {
            return false;
        }
    }
    match name_filter.map(str::trim) {
        Some(pattern) if !pattern.is_empty() => device
            .name
            .as_ref()
            .map(|name| name.to_lowercase().contains(&pattern.to_lowercase()))
            .unwrap_or(false),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str, name: Option<&str>, rssi: i16) -> BleDevice {
        BleDevice::new(id, name.map(str::to_string), rssi)
    }

    #[test]
    fn upsert_replaces_same_identifier() {
        let mut devices = Vec::new();
        assert!(upsert_device(&mut devices, device("A", Some("Band"), -70)));
        assert!(upsert_device(&mut devices, device("B", None, -60)));
        assert!(upsert_device(&mut devices, device("A", Some("Band 2"), -40)));
        assert!(!upsert_device(&mut devices, device("A", Some("Band 2"), -40)));

        assert_eq!(devices.len(), 2);
        let a = devices.iter().find(|d| d.id == "A").unwrap();
        assert_eq!(a.name.as_deref(), Some("Band 2"));
        assert_eq!(a.rssi, -40);
    }

    #[test]
    fn name_filter_is_case_insensitive() {
        let devices = vec![
            device("A", Some("Polar H10"), -50),
            device("B", Some("Mi Band"), -60),
            device("C", None, -30),
        ];
        let hits = filter_by_name(&devices, "polar");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "A");
        assert_eq!(filter_by_name(&devices, "  ").len(), 3);
    }

    #[test]
    fn rssi_filter_and_sort() {
        let devices = vec![
            device("A", None, -80),
            device("B", None, -40),
            device("C", None, -60),
        ];
        let strong = filter_by_min_rssi(&devices, -60);
        assert_eq!(strong.len(), 2);

        let ids: Vec<_> = sort_by_signal_strength(&devices)
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["B", "C", "A"]);
    }

    #[test]
    fn scan_filter_combines_rssi_and_name() {
        let d = device("A", Some("Polar H10"), -70);
        assert!(matches_scan_filter(&d, None, None));
        assert!(matches_scan_filter(&d, Some(-80), Some("h10")));
        assert!(!matches_scan_filter(&d, Some(-60), None));
        assert!(!matches_scan_filter(&d, None, Some("garmin")));
        assert!(!matches_scan_filter(&device("B", None, -10), None, Some("polar")));
    }
}
