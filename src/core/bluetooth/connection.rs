//! Hardware adapter backed by `bluest`
//! Implements [`PlatformAdapter`] on top of the host Bluetooth stack
//! (CoreBluetooth, WinRT or BlueZ, picked by `bluest` at build time).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use bluest::{Adapter, AdapterEvent as RadioEvent, Characteristic, ConnectionEvent, Device, Service, Uuid};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::adapter::{AdapterEvent, AdapterEventSender, PlatformAdapter};
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::notification::NotificationHandler;
use crate::core::bluetooth::scanner::{device_identifier, BluetoothScanner};
use crate::core::bluetooth::types::RadioState;

/// The one open GATT session
struct Session {
    id: String,
    device: Device,
    services: HashMap<Uuid, Service>,
    characteristics: HashMap<Uuid, Characteristic>,
    cancel_token: CancellationToken,
}

pub struct BluestAdapter {
    adapter: Adapter,
    events: AdapterEventSender,
    devices: Arc<Mutex<HashMap<String, Device>>>,
    scanner: tokio::sync::Mutex<BluetoothScanner>,
    session: tokio::sync::Mutex<Option<Session>>,
    notification_handler: NotificationHandler,
    radio_task: JoinHandle<()>,
}

impl BluestAdapter {
    /// Opens the default host adapter. Events are reported on `events`.
    pub async fn new(events: AdapterEventSender) -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        info!("Bluetooth adapter found");

        let devices = Arc::new(Mutex::new(HashMap::new()));
        let scanner = BluetoothScanner::new(adapter.clone(), devices.clone(), events.clone());
        let radio_task = tokio::spawn(Self::watch_radio(adapter.clone(), events.clone()));

        Ok(Self {
            notification_handler: NotificationHandler::new(events.clone()),
            adapter,
            events,
            devices,
            scanner: tokio::sync::Mutex::new(scanner),
            session: tokio::sync::Mutex::new(None),
            radio_task,
        })
    }

    async fn watch_radio(adapter: Adapter, events: AdapterEventSender) {
        let stream = match adapter.events().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Radio state events unavailable: {}", e);
                return;
            }
        };
        tokio::pin!(stream);

        while let Some(event) = stream.next().await {
            let state = match event {
                Ok(RadioEvent::Available) => RadioState::PoweredOn,
                Ok(RadioEvent::Unavailable) => RadioState::PoweredOff,
                Err(e) => {
                    error!("Error in radio event stream: {}", e);
                    break;
                }
            };
            if events.send(AdapterEvent::RadioStateChanged(state)).is_err() {
                break;
            }
        }
        debug!("Radio event stream ended");
    }

    /// Dials `device` and then watches its link until it drops or the session is closed.
    async fn run_session(
        adapter: Adapter,
        device: Device,
        id: String,
        events: AdapterEventSender,
        cancel_token: CancellationToken,
    ) {
        if !device.is_connected().await {
            info!("Initiating connection to {}...", id);
            let result = tokio::select! {
                _ = cancel_token.cancelled() => return,
                result = adapter.connect_device(&device) => result,
            };
            if let Err(e) = result {
                let _ = events.send(AdapterEvent::FailedToConnect {
                    id,
                    error: Some(e.to_string()),
                });
                return;
            }
        }

        let connection_events = adapter.device_connection_events(&device).await;
        if events.send(AdapterEvent::Connected { id: id.clone() }).is_err() {
            return;
        }

        let connection_events = match connection_events {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Connection events unavailable for {}: {}", id, e);
                return;
            }
        };
        tokio::pin!(connection_events);
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                event = connection_events.next() => match event {
                    Some(ConnectionEvent::Disconnected) => {
                        let _ = events.send(AdapterEvent::Disconnected { id, error: None });
                        break;
                    }
                    Some(ConnectionEvent::Connected) => {}
                    None => break,
                }
            }
        }
    }

    async fn find_device(&self, device_id: &str) -> Result<Device, BleError> {
        let known = self
            .devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(device_id)
            .cloned();
        if let Some(device) = known {
            return Ok(device);
        }

        self.adapter
            .connected_devices()
            .await?
            .into_iter()
            .find(|device| device_identifier(device) == device_id)
            .ok_or_else(|| BleError::DeviceNotFound(device_id.to_string()))
    }

    async fn session_device(&self) -> Result<Device, BleError> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.device.clone())
            .ok_or(BleError::NotConnected)
    }
}

#[async_trait::async_trait]
impl PlatformAdapter for BluestAdapter {
    async fn start_scan(&self) -> Result<(), BleError> {
        self.scanner
            .lock()
            .await
            .start_scan()
            .await
            .map_err(|e| BleError::Operation(e.to_string()))
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.scanner
            .lock()
            .await
            .stop_scan()
            .await
            .map_err(|e| BleError::Operation(e.to_string()))
    }

    async fn open_session(&self, device_id: &str) -> Result<(), BleError> {
        let device = self.find_device(device_id).await?;
        self.close_session().await?;

        let cancel_token = CancellationToken::new();
        *self.session.lock().await = Some(Session {
            id: device_id.to_string(),
            device: device.clone(),
            services: HashMap::new(),
            characteristics: HashMap::new(),
            cancel_token: cancel_token.clone(),
        });

        tokio::spawn(Self::run_session(
            self.adapter.clone(),
            device,
            device_id.to_string(),
            self.events.clone(),
            cancel_token,
        ));
        Ok(())
    }

    async fn close_session(&self) -> Result<(), BleError> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };
        session.cancel_token.cancel();
        self.notification_handler.stop_all();

        if session.device.is_connected().await {
            info!("Disconnecting from device {}", session.id);
            self.adapter.disconnect_device(&session.device).await?;
            info!("Successfully disconnected");
            let _ = self.events.send(AdapterEvent::Disconnected {
                id: session.id,
                error: None,
            });
        } else {
            debug!("Device {} not connected", session.id);
        }
        Ok(())
    }

    async fn discover_services(&self) -> Result<(), BleError> {
        let device = self.session_device().await?;
        let services = device.discover_services().await?;
        let uuids = services.iter().map(|s| s.uuid()).collect();

        if let Some(session) = self.session.lock().await.as_mut() {
            session.services = services.into_iter().map(|s| (s.uuid(), s)).collect();
        }
        let _ = self
            .events
            .send(AdapterEvent::ServicesDiscovered { services: uuids });
        Ok(())
    }

    async fn discover_characteristics(&self, service: Uuid) -> Result<(), BleError> {
        let found = self
            .session
            .lock()
            .await
            .as_ref()
            .ok_or(BleError::NotConnected)?
            .services
            .get(&service)
            .cloned()
            .ok_or(BleError::ServiceNotFound(service))?;

        let characteristics = found.discover_characteristics().await?;
        let uuids = characteristics.iter().map(|c| c.uuid()).collect();

        if let Some(session) = self.session.lock().await.as_mut() {
            session
                .characteristics
                .extend(characteristics.into_iter().map(|c| (c.uuid(), c)));
        }
        let _ = self.events.send(AdapterEvent::CharacteristicsDiscovered {
            service,
            characteristics: uuids,
        });
        Ok(())
    }

    async fn read_characteristic(&self, characteristic: Uuid) -> Result<(), BleError> {
        let found = self.characteristic(characteristic).await?;
        let value = found.read().await?;
        let _ = self.events.send(AdapterEvent::ValueUpdated {
            characteristic,
            value,
        });
        Ok(())
    }

    async fn set_notify(&self, characteristic: Uuid, enabled: bool) -> Result<(), BleError> {
        if enabled {
            let found = self.characteristic(characteristic).await?;
            self.notification_handler.subscribe(found);
        } else {
            self.notification_handler.unsubscribe(characteristic);
        }
        Ok(())
    }

    async fn radio_state(&self) -> RadioState {
        match self.adapter.is_available().await {
            Ok(true) => RadioState::PoweredOn,
            Ok(false) => RadioState::PoweredOff,
            Err(e) => match BleError::from(e) {
                BleError::Unauthorized => RadioState::Unauthorized,
                _ => RadioState::Unknown,
            },
        }
    }
}

impl BluestAdapter {
    async fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, BleError> {
        self.session
            .lock()
            .await
            .as_ref()
            .ok_or(BleError::NotConnected)?
            .characteristics
            .get(&uuid)
            .cloned()
            .ok_or(BleError::CharacteristicNotFound(uuid))
    }
}

impl Drop for BluestAdapter {
    fn drop(&mut self) {
        self.radio_task.abort();
        self.notification_handler.stop_all();
    }
}
