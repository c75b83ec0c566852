use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::Result;
use bluest::{Adapter, AdvertisingDevice, Device};
use futures_util::StreamExt;
use log::{debug, error, info};
use regex::Regex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::adapter::{AdapterEvent, AdapterEventSender};
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::types::{BleDevice, RadioState};

/// Reported when the platform gives no signal strength
const UNKNOWN_RSSI: i16 = -127;

pub struct BluetoothScanner {
    adapter: Adapter,
    devices: Arc<Mutex<HashMap<String, Device>>>,
    events: AdapterEventSender,
    cancel_token: Arc<CancellationToken>,
    scan_task_handle: Option<JoinHandle<Result<()>>>,
}

impl BluetoothScanner {
    pub fn new(
        adapter: Adapter,
        devices: Arc<Mutex<HashMap<String, Device>>>,
        events: AdapterEventSender,
    ) -> Self {
        Self {
            adapter,
            devices,
            events,
            cancel_token: Arc::new(CancellationToken::new()),
            scan_task_handle: None,
        }
    }

    pub async fn start_scan(&mut self) -> Result<()> {
        if self.scan_task_handle.is_some() {
            self.stop_scan().await?;
        }

        self.cancel_token = Arc::new(CancellationToken::new());
        let cancel_token_for_task = self.cancel_token.clone();
        let adapter_for_task = self.adapter.clone();
        let devices_for_task = self.devices.clone();
        let events_for_task = self.events.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = Self::internal_scan_task(
                adapter_for_task,
                devices_for_task,
                events_for_task.clone(),
                cancel_token_for_task,
            )
            .await
            {
                error!("Bluetooth scan failed: {}", e);
                if let Some(BleError::Unauthorized) = e.downcast_ref::<BleError>() {
                    let _ = events_for_task
                        .send(AdapterEvent::RadioStateChanged(RadioState::Unauthorized));
                }
                let _ = events_for_task.send(AdapterEvent::ScanFailed(e.to_string()));
            }
            Ok(())
        });

        self.scan_task_handle = Some(handle);
        info!("Device scan task started.");
        Ok(())
    }

    /// Streams advertisements until cancelled, reporting each one as `DeviceFound`
    async fn internal_scan_task(
        adapter: Adapter,
        devices: Arc<Mutex<HashMap<String, Device>>>,
        events: AdapterEventSender,
        cancel_token: Arc<CancellationToken>,
    ) -> Result<()> {
        // Peripherals already linked to this host do not advertise
        info!("Checking for connected devices");
        let connected_devices = adapter.connected_devices().await.map_err(BleError::from)?;
        for device in connected_devices {
            let rssi = device.rssi().await.unwrap_or(UNKNOWN_RSSI);
            let name = device.name().ok();
            Self::report_device(&devices, &events, device, name, rssi);
        }

        info!("Starting bluetooth scan");
        let mut scan_stream = adapter.scan(&[]).await.map_err(BleError::from)?;

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    match result {
                        Some(AdvertisingDevice { device, adv_data, rssi }) => {
                            let name = adv_data.local_name.or_else(|| device.name().ok());
                            Self::report_device(&devices, &events, device, name, rssi.unwrap_or(UNKNOWN_RSSI));
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    }
                }
                _ = cancel_token.cancelled() => {
                    break;
                }
            }
        }
        Ok(())
    }

    pub async fn stop_scan(&mut self) -> Result<()> {
        info!("Stopping Bluetooth scan.");
        self.cancel_token.cancel();

        if let Some(handle) = self.scan_task_handle.take() {
            match handle.await {
                Ok(task_result) => match task_result {
                    Ok(_) => debug!("Scan task finished after cancellation."),
                    Err(e) => error!("Scan task finished with an error: {:?}", e),
                },
                Err(e) => {
                    if e.is_cancelled() {
                        info!("Scan task was cancelled successfully.");
                    } else {
                        error!("Scan task finished with an unexpected join error: {:?}", e);
                    }
                }
            }
        } else {
            debug!("No active scan task handle found to wait for.");
        }
        Ok(())
    }

    fn report_device(
        devices: &Arc<Mutex<HashMap<String, Device>>>,
        events: &AdapterEventSender,
        device: Device,
        name: Option<String>,
        rssi: i16,
    ) {
        let id = device_identifier(&device);
        debug!("Found device - ID: {}, Name: {:?}, RSSI: {}", id, name, rssi);

        devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.clone(), device);

        if events
            .send(AdapterEvent::DeviceFound(BleDevice::new(id, name, rssi)))
            .is_err()
        {
            debug!("Event receiver dropped, discarding discovery");
        }
    }
}

/// Stable identifier for a peripheral: its MAC address where the platform
/// exposes one inside the device id, the raw id otherwise.
pub fn device_identifier(device: &Device) -> String {
    let raw = device.id().to_string();
    extract_mac_address(&raw).unwrap_or(raw)
}

fn extract_mac_address(device_id_str: &str) -> Option<String> {
    static MAC_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = MAC_RE
        .get_or_init(|| Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").ok())
        .as_ref()?;
    re.find_iter(device_id_str)
        .last()
        .map(|m| m.as_str().to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_mac_address() {
        assert_eq!(
            extract_mac_address("BluetoothLE#BluetoothLEd0:c5:d3:00:11:22-aa:bb:cc:dd:ee:ff"),
            Some("AA:BB:CC:DD:EE:FF".to_string())
        );
        assert_eq!(
            extract_mac_address("hci0/dev_2C_BA_BA_2E_17_D5"),
            None
        );
        assert_eq!(
            extract_mac_address("2c-ba-ba-2e-17-d5"),
            Some("2C-BA-BA-2E-17-D5".to_string())
        );
    }

    #[test]
    fn test_opaque_ids_have_no_mac() {
        assert_eq!(
            extract_mac_address("7A1C6F0E-3B53-4A3E-9E6A-2F0D0A8C1B44"),
            None
        );
    }
}
