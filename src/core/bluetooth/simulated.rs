//! In-process peripheral simulator
//! A [`PlatformAdapter`] with scripted peripherals, used for `--simulate`
//! runs and by the tests. Every call is recorded so callers can assert on
//! what the connection manager asked the radio to do.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::adapter::{AdapterEvent, AdapterEventSender, PlatformAdapter};
use crate::core::bluetooth::constants::{
    UUID_BATTERY_LEVEL, UUID_BATTERY_SERVICE, UUID_HEART_RATE_MEASUREMENT, UUID_HEART_RATE_SERVICE,
};
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::types::{BleDevice, RadioState};

/// A fake peripheral
#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    pub device: BleDevice,
    pub battery_level: Option<u8>,
    /// Raw Heart Rate Measurement payload
    pub heart_rate: Option<Vec<u8>>,
    /// Additional readable characteristics, each under its own service
    pub extra: Vec<(Uuid, Uuid, Vec<u8>)>,
    /// Upcoming connection attempts that fail
    pub failing_connects: u32,
    /// Unreachable peripherals never answer a connection request
    pub reachable: bool,
}

impl SimulatedPeripheral {
    pub fn new(id: impl Into<String>, name: Option<&str>, rssi: i16) -> Self {
        Self {
            device: BleDevice::new(id, name.map(str::to_string), rssi),
            battery_level: None,
            heart_rate: None,
            extra: Vec::new(),
            failing_connects: 0,
            reachable: true,
        }
    }

    pub fn with_battery(mut self, percentage: u8) -> Self {
        self.battery_level = Some(percentage);
        self
    }

    pub fn with_heart_rate(mut self, payload: Vec<u8>) -> Self {
        self.heart_rate = Some(payload);
        self
    }

    pub fn with_characteristic(mut self, service: Uuid, characteristic: Uuid, value: Vec<u8>) -> Self {
        self.extra.push((service, characteristic, value));
        self
    }

    fn services(&self) -> Vec<Uuid> {
        let mut services = Vec::new();
        if self.battery_level.is_some() {
            services.push(UUID_BATTERY_SERVICE);
        }
        if self.heart_rate.is_some() {
            services.push(UUID_HEART_RATE_SERVICE);
        }
        for (service, _, _) in &self.extra {
            if !services.contains(service) {
                services.push(*service);
            }
        }
        services
    }

    fn characteristics(&self, service: Uuid) -> Option<Vec<Uuid>> {
        if service == UUID_BATTERY_SERVICE && self.battery_level.is_some() {
            return Some(vec![UUID_BATTERY_LEVEL]);
        }
        if service == UUID_HEART_RATE_SERVICE && self.heart_rate.is_some() {
            return Some(vec![UUID_HEART_RATE_MEASUREMENT]);
        }
        let extra: Vec<Uuid> = self
            .extra
            .iter()
            .filter(|(s, _, _)| *s == service)
            .map(|(_, c, _)| *c)
            .collect();
        (!extra.is_empty()).then_some(extra)
    }

    fn value(&self, characteristic: Uuid) -> Option<Vec<u8>> {
        if characteristic == UUID_BATTERY_LEVEL {
            return self.battery_level.map(|level| vec![level]);
        }
        if characteristic == UUID_HEART_RATE_MEASUREMENT {
            return self.heart_rate.clone();
        }
        self.extra
            .iter()
            .find(|(_, c, _)| *c == characteristic)
            .map(|(_, _, value)| value.clone())
    }
}

/// One recorded adapter call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCall {
    StartScan,
    StopScan,
    OpenSession(String),
    CloseSession,
    DiscoverServices,
    DiscoverCharacteristics(Uuid),
    ReadCharacteristic(Uuid),
    SetNotify(Uuid, bool),
}

#[derive(Default)]
struct SimState {
    peripherals: Vec<SimulatedPeripheral>,
    radio: RadioState,
    scanning: bool,
    session: Option<String>,
    notifications: HashMap<Uuid, CancellationToken>,
    calls: Vec<AdapterCall>,
}

pub struct SimulatedAdapter {
    events: AdapterEventSender,
    state: Arc<Mutex<SimState>>,
    notify_interval: Option<Duration>,
}

impl SimulatedAdapter {
    /// A powered-on radio with the given peripherals in range.
    pub fn new(events: AdapterEventSender, peripherals: Vec<SimulatedPeripheral>) -> Self {
        Self {
            events,
            state: Arc::new(Mutex::new(SimState {
                peripherals,
                radio: RadioState::PoweredOn,
                ..SimState::default()
            })),
            notify_interval: None,
        }
    }

    /// Two heart-rate straps and an unrelated beacon.
    pub fn demo(events: AdapterEventSender) -> Self {
        Self::new(
            events,
            vec![
                SimulatedPeripheral::new("C4:7C:8D:6A:12:01", Some("Polar H10 6A1201"), -58)
                    .with_battery(87)
                    .with_heart_rate(vec![0x06, 68]),
                SimulatedPeripheral::new("E2:11:4B:90:3F:7C", Some("Wahoo TICKR 3F7C"), -71)
                    .with_battery(42)
                    .with_heart_rate(vec![0x01, 0x48, 0x00]),
                SimulatedPeripheral::new("5A:02:C9:77:01:AE", None, -90),
            ],
        )
        .with_notify_interval(Duration::from_secs(1))
    }

    /// Repeats heart-rate notifications at `interval` while subscribed.
    pub fn with_notify_interval(mut self, interval: Duration) -> Self {
        self.notify_interval = Some(interval);
        self
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, call: &AdapterCall) -> usize {
        self.lock().calls.iter().filter(|c| *c == call).count()
    }

    pub fn session(&self) -> Option<String> {
        self.lock().session.clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scanning
    }

    /// The next `count` connection attempts to `id` fail.
    pub fn fail_next_connects(&self, id: &str, count: u32) {
        if let Some(p) = self.lock().peripherals.iter_mut().find(|p| p.device.id == id) {
            p.failing_connects = count;
        }
    }

    pub fn set_reachable(&self, id: &str, reachable: bool) {
        if let Some(p) = self.lock().peripherals.iter_mut().find(|p| p.device.id == id) {
            p.reachable = reachable;
        }
    }

    /// Drops the live link as if the peripheral walked out of range.
    pub fn drop_connection(&self, reason: &str) {
        let dropped = {
            let mut state = self.lock();
            Self::cancel_notifications(&mut state);
            state.session.take()
        };
        if let Some(id) = dropped {
            info!("Simulated link to {} dropped: {}", id, reason);
            self.emit(AdapterEvent::Disconnected {
                id,
                error: Some(reason.to_string()),
            });
        }
    }

    /// Flips the radio. Powering off drops the live link after the state change.
    pub fn set_radio_state(&self, radio: RadioState) {
        let dropped = {
            let mut state = self.lock();
            state.radio = radio;
            if radio == RadioState::PoweredOn {
                None
            } else {
                state.scanning = false;
                Self::cancel_notifications(&mut state);
                state.session.take()
            }
        };
        self.emit(AdapterEvent::RadioStateChanged(radio));
        if let Some(id) = dropped {
            self.emit(AdapterEvent::Disconnected {
                id,
                error: Some("Bluetooth powered off".to_string()),
            });
        }
    }

    /// Pushes a notification on `characteristic` if a session is open.
    pub fn push_value(&self, characteristic: Uuid, value: Vec<u8>) {
        if self.lock().session.is_some() {
            self.emit(AdapterEvent::ValueUpdated {
                characteristic,
                value,
            });
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: AdapterCall) -> MutexGuard<'_, SimState> {
        let mut state = self.lock();
        state.calls.push(call);
        state
    }

    fn emit(&self, event: AdapterEvent) {
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    fn cancel_notifications(state: &mut SimState) {
        for (_, token) in state.notifications.drain() {
            token.cancel();
        }
    }

    fn require_radio(state: &SimState) -> Result<(), BleError> {
        match state.radio {
            RadioState::PoweredOn => Ok(()),
            RadioState::Unauthorized => Err(BleError::Unauthorized),
            _ => Err(BleError::AdapterUnavailable),
        }
    }

    fn connected_peripheral(state: &SimState) -> Result<SimulatedPeripheral, BleError> {
        let id = state.session.as_ref().ok_or(BleError::NotConnected)?;
        state
            .peripherals
            .iter()
            .find(|p| &p.device.id == id)
            .cloned()
            .ok_or(BleError::NotConnected)
    }

    fn spawn_heart_rate_ticker(&self, payload: Vec<u8>, interval: Duration, cancel_token: CancellationToken) {
        let events = self.events.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut ticks: u16 = 0;
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        ticks = ticks.wrapping_add(1);
                        let live = state
                            .lock()
                            .map(|s| s.session.is_some())
                            .unwrap_or(false);
                        if !live {
                            break;
                        }
                        let value = drift_heart_rate(&payload, ticks);
                        let event = AdapterEvent::ValueUpdated {
                            characteristic: UUID_HEART_RATE_MEASUREMENT,
                            value,
                        };
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

/// Nudges the BPM in `payload` by a small repeating offset.
fn drift_heart_rate(payload: &[u8], tick: u16) -> Vec<u8> {
    let offset = [0i16, 1, 3, 2, 0, -1, -3, -2][usize::from(tick % 8)];
    let mut value = payload.to_vec();
    match value.as_mut_slice() {
        [flags, lo, hi, ..] if *flags & 0x01 != 0 => {
            let bpm = u16::from_le_bytes([*lo, *hi]).saturating_add_signed(offset);
            let [new_lo, new_hi] = bpm.to_le_bytes();
            *lo = new_lo;
            *hi = new_hi;
        }
        [flags, bpm, ..] if *flags & 0x01 == 0 => {
            *bpm = bpm.saturating_add_signed(offset as i8);
        }
        _ => {}
    }
    value
}

#[async_trait::async_trait]
impl PlatformAdapter for SimulatedAdapter {
    async fn start_scan(&self) -> Result<(), BleError> {
        let found = {
            let mut state = self.record(AdapterCall::StartScan);
            Self::require_radio(&state)?;
            state.scanning = true;
            state
                .peripherals
                .iter()
                .filter(|p| p.reachable)
                .map(|p| p.device.clone())
                .collect::<Vec<_>>()
        };
        for device in found {
            self.emit(AdapterEvent::DeviceFound(device));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.record(AdapterCall::StopScan).scanning = false;
        Ok(())
    }

    async fn open_session(&self, device_id: &str) -> Result<(), BleError> {
        let event = {
            let mut state = self.record(AdapterCall::OpenSession(device_id.to_string()));
            Self::require_radio(&state)?;
            let peripheral = state
                .peripherals
                .iter_mut()
                .find(|p| p.device.id == device_id)
                .ok_or_else(|| BleError::DeviceNotFound(device_id.to_string()))?;

            if !peripheral.reachable {
                // never answers; the caller times out
                return Ok(());
            }
            if peripheral.failing_connects > 0 {
                peripheral.failing_connects -= 1;
                AdapterEvent::FailedToConnect {
                    id: device_id.to_string(),
                    error: Some("Peripheral did not respond".to_string()),
                }
            } else {
                state.session = Some(device_id.to_string());
                AdapterEvent::Connected {
                    id: device_id.to_string(),
                }
            }
        };
        self.emit(event);
        Ok(())
    }

    async fn close_session(&self) -> Result<(), BleError> {
        let closed = {
            let mut state = self.record(AdapterCall::CloseSession);
            Self::cancel_notifications(&mut state);
            state.session.take()
        };
        if let Some(id) = closed {
            self.emit(AdapterEvent::Disconnected { id, error: None });
        }
        Ok(())
    }

    async fn discover_services(&self) -> Result<(), BleError> {
        let services = {
            let state = self.record(AdapterCall::DiscoverServices);
            Self::connected_peripheral(&state)?.services()
        };
        self.emit(AdapterEvent::ServicesDiscovered { services });
        Ok(())
    }

    async fn discover_characteristics(&self, service: Uuid) -> Result<(), BleError> {
        let characteristics = {
            let state = self.record(AdapterCall::DiscoverCharacteristics(service));
            Self::connected_peripheral(&state)?
                .characteristics(service)
                .ok_or(BleError::ServiceNotFound(service))?
        };
        self.emit(AdapterEvent::CharacteristicsDiscovered {
            service,
            characteristics,
        });
        Ok(())
    }

    async fn read_characteristic(&self, characteristic: Uuid) -> Result<(), BleError> {
        let value = {
            let state = self.record(AdapterCall::ReadCharacteristic(characteristic));
            Self::connected_peripheral(&state)?
                .value(characteristic)
                .ok_or(BleError::CharacteristicNotFound(characteristic))?
        };
        self.emit(AdapterEvent::ValueUpdated {
            characteristic,
            value,
        });
        Ok(())
    }

    async fn set_notify(&self, characteristic: Uuid, enabled: bool) -> Result<(), BleError> {
        let subscribed = {
            let mut state = self.record(AdapterCall::SetNotify(characteristic, enabled));
            let value = Self::connected_peripheral(&state)?
                .value(characteristic)
                .ok_or(BleError::CharacteristicNotFound(characteristic))?;

            if let Some(previous) = state.notifications.remove(&characteristic) {
                previous.cancel();
            }
            if enabled {
                let token = CancellationToken::new();
                state.notifications.insert(characteristic, token.clone());
                Some((value, token))
            } else {
                None
            }
        };

        if let Some((value, token)) = subscribed {
            self.emit(AdapterEvent::ValueUpdated {
                characteristic,
                value: value.clone(),
            });
            if let Some(interval) = self.notify_interval {
                if characteristic == UUID_HEART_RATE_MEASUREMENT {
                    self.spawn_heart_rate_ticker(value, interval, token);
                }
            }
        }
        Ok(())
    }

    async fn radio_state(&self) -> RadioState {
        self.lock().radio
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::adapter::event_channel;

    fn strap() -> SimulatedPeripheral {
        SimulatedPeripheral::new("AA:01", Some("Strap"), -60)
            .with_battery(90)
            .with_heart_rate(vec![0x00, 72])
    }

    #[tokio::test]
    async fn scan_reports_reachable_peripherals() {
        let (tx, mut rx) = event_channel();
        let adapter = SimulatedAdapter::new(
            tx,
            vec![strap(), SimulatedPeripheral::new("AA:02", None, -80)],
        );
        adapter.set_reachable("AA:02", false);

        adapter.start_scan().await.unwrap();
        assert!(adapter.is_scanning());
        assert_eq!(
            rx.recv().await,
            Some(AdapterEvent::DeviceFound(strap().device))
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failing_connects_are_consumed() {
        let (tx, mut rx) = event_channel();
        let adapter = SimulatedAdapter::new(tx, vec![strap()]);
        adapter.fail_next_connects("AA:01", 1);

        adapter.open_session("AA:01").await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(AdapterEvent::FailedToConnect { .. })
        ));

        adapter.open_session("AA:01").await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(AdapterEvent::Connected { id: "AA:01".to_string() })
        );
        assert_eq!(adapter.session().as_deref(), Some("AA:01"));
    }

    #[tokio::test]
    async fn unknown_device_and_radio_off_fail_synchronously() {
        let (tx, _rx) = event_channel();
        let adapter = SimulatedAdapter::new(tx, vec![strap()]);

        assert_eq!(
            adapter.open_session("nope").await,
            Err(BleError::DeviceNotFound("nope".to_string()))
        );

        adapter.set_radio_state(RadioState::PoweredOff);
        assert_eq!(
            adapter.start_scan().await,
            Err(BleError::AdapterUnavailable)
        );
    }

    #[tokio::test]
    async fn gatt_calls_require_a_session() {
        let (tx, _rx) = event_channel();
        let adapter = SimulatedAdapter::new(tx, vec![strap()]);
        assert_eq!(
            adapter.discover_services().await,
            Err(BleError::NotConnected)
        );
    }

    #[tokio::test]
    async fn close_session_reports_disconnect_once() {
        let (tx, mut rx) = event_channel();
        let adapter = SimulatedAdapter::new(tx, vec![strap()]);
        adapter.open_session("AA:01").await.unwrap();
        rx.recv().await;

        adapter.close_session().await.unwrap();
        adapter.close_session().await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(AdapterEvent::Disconnected {
                id: "AA:01".to_string(),
                error: None
            })
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(adapter.count_calls(&AdapterCall::CloseSession), 2);
    }

    #[test]
    fn drift_keeps_payload_shape() {
        assert_eq!(drift_heart_rate(&[0x00, 70], 2), vec![0x00, 73]);
        assert_eq!(drift_heart_rate(&[0x01, 0x48, 0x00], 6), vec![0x01, 0x45, 0x00]);
        assert_eq!(drift_heart_rate(&[0x00], 1), vec![0x00]);
    }
}
