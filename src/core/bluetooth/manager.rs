//! Connection manager
//! Owns the scan → connect → discover → subscribe → disconnect lifecycle,
//! publishes its state on `watch` channels and hands unexpected drops to the
//! [`AutoReconnectManager`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::adapter::{AdapterEvent, AdapterEventReceiver, PlatformAdapter};
use crate::core::bluetooth::constants::{
    scan_duration, RECONNECT_CONFIRM_TIMEOUT_MS, UUID_BATTERY_LEVEL, UUID_BATTERY_SERVICE,
    UUID_HEART_RATE_MEASUREMENT, UUID_HEART_RATE_SERVICE,
};
use crate::core::bluetooth::device::{matches_scan_filter, upsert_device};
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::reconnect::{AutoReconnectManager, ReconnectPolicy};
use crate::core::bluetooth::types::{
    BatteryLevel, BleDevice, ConnectionState, DeviceInfo, HeartRate, RadioState, ReconnectState,
};
use crate::core::decoder::{parse_battery_level, parse_heart_rate, to_hex};

/// Tunables for the connection manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// A scan stops by itself after this long
    pub scan_duration: Duration,
    /// Discovery events below this RSSI are dropped
    pub min_rssi: Option<i16>,
    /// Discovery events whose name lacks this substring are dropped
    pub name_filter: Option<String>,
    /// Initial auto-reconnect switch
    pub auto_reconnect: bool,
    pub reconnect_policy: ReconnectPolicy,
    /// How long one reconnect attempt waits for `Connected`
    pub confirm_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            scan_duration: scan_duration(),
            min_rssi: None,
            name_filter: None,
            auto_reconnect: true,
            reconnect_policy: ReconnectPolicy::default(),
            confirm_timeout: Duration::from_millis(RECONNECT_CONFIRM_TIMEOUT_MS),
        }
    }
}

/// Manages the single BLE session and everything published about it
pub struct ConnectionManager {
    adapter: Arc<dyn PlatformAdapter>,
    config: ManagerConfig,
    reconnect: AutoReconnectManager,
    devices_tx: watch::Sender<Vec<BleDevice>>,
    connection_tx: watch::Sender<ConnectionState>,
    device_info_tx: watch::Sender<Option<DeviceInfo>>,
    radio_tx: watch::Sender<RadioState>,
    scanning_tx: watch::Sender<bool>,
    auto_reconnect_enabled: AtomicBool,
    manual_disconnect: AtomicBool,
    /// Serializes updates that touch both the connection state and the device info
    transition: Mutex<()>,
    scan_timer: Mutex<Option<CancellationToken>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Creates the manager and starts consuming `events` from `adapter`.
    pub async fn new(
        adapter: Arc<dyn PlatformAdapter>,
        events: AdapterEventReceiver,
        config: ManagerConfig,
    ) -> Arc<Self> {
        let initial_radio = adapter.radio_state().await;
        info!("Initial Bluetooth state: {:?}", initial_radio);

        let (devices_tx, _) = watch::channel(Vec::new());
        let (connection_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (device_info_tx, _) = watch::channel(None);
        let (radio_tx, _) = watch::channel(initial_radio);
        let (scanning_tx, _) = watch::channel(false);

        let manager = Arc::new(Self {
            adapter,
            reconnect: AutoReconnectManager::new(config.reconnect_policy.clone()),
            auto_reconnect_enabled: AtomicBool::new(config.auto_reconnect),
            config,
            devices_tx,
            connection_tx,
            device_info_tx,
            radio_tx,
            scanning_tx,
            manual_disconnect: AtomicBool::new(false),
            transition: Mutex::new(()),
            scan_timer: Mutex::new(None),
            event_task: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::run_event_loop(Arc::downgrade(&manager), events));
        *lock(&manager.event_task) = Some(handle);
        manager
    }

    /// Clears the device list and starts discovery. Stops by itself after the scan duration.
    pub async fn start_scan(self: &Arc<Self>) {
        let started = self.scanning_tx.send_if_modified(|scanning| {
            if *scanning {
                false
            } else {
                *scanning = true;
                true
            }
        });
        if !started {
            debug!("Scan already running, ignoring start request");
            return;
        }

        self.devices_tx.send_replace(Vec::new());

        if let Err(e) = self.adapter.start_scan().await {
            error!("Failed to start scan: {}", e);
            self.scanning_tx.send_replace(false);
            self.note_fault(&e);
            return;
        }
        info!("Device scan started");

        let cancel_token = CancellationToken::new();
        if let Some(previous) = lock(&self.scan_timer).replace(cancel_token.clone()) {
            previous.cancel();
        }

        let manager = Arc::downgrade(self);
        let duration = self.config.scan_duration;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel_token.cancelled() => {}
                _ = tokio::time::sleep(duration) => {
                    if let Some(manager) = manager.upgrade() {
                        info!("Scan duration of {} ms elapsed", duration.as_millis());
                        manager.stop_scan().await;
                    }
                }
            }
        });
    }

    /// Stops discovery. No-op when not scanning.
    pub async fn stop_scan(&self) {
        let stopped = self.scanning_tx.send_if_modified(|scanning| {
            if *scanning {
                *scanning = false;
                true
            } else {
                false
            }
        });
        if !stopped {
            return;
        }

        if let Some(timer) = lock(&self.scan_timer).take() {
            timer.cancel();
        }
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        info!("Device scan stopped");
    }

    /// Opens a session to `device`. Ignored while another attempt is in flight or a session is live.
    pub async fn connect(&self, device: BleDevice) {
        if self.connection_tx.borrow().is_busy() {
            warn!(
                "Already connecting/connected, ignoring connect to {}",
                device.display_name()
            );
            return;
        }
        self.stop_reconnect_loop().await;
        self.begin_connect(device).await;
    }

    /// User-initiated disconnect. Suppresses auto-reconnect.
    pub async fn disconnect(&self) {
        self.manual_disconnect.store(true, Ordering::SeqCst);
        let previous = {
            let _guard = lock(&self.transition);
            let previous = self.connection_tx.send_replace(ConnectionState::Disconnected);
            self.device_info_tx.send_replace(None);
            previous
        };
        self.reconnect.clear_saved_device();

        if previous.is_busy() {
            if let Err(e) = self.adapter.close_session().await {
                warn!("Failed to close session: {}", e);
            }
        }
        info!("Disconnected by user");
    }

    /// Switches auto-reconnect for future unexpected drops. Disabling stops a running loop.
    pub async fn enable_auto_reconnect(&self, enabled: bool) {
        self.auto_reconnect_enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.stop_reconnect_loop().await;
        }
        info!(
            "Auto-reconnect {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn auto_reconnect_enabled(&self) -> bool {
        self.auto_reconnect_enabled.load(Ordering::SeqCst)
    }

    pub fn scanned_devices(&self) -> Vec<BleDevice> {
        self.devices_tx.borrow().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_tx.borrow().clone()
    }

    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.device_info_tx.borrow().clone()
    }

    pub fn reconnect_state(&self) -> ReconnectState {
        self.reconnect.state()
    }

    pub fn radio_state(&self) -> RadioState {
        *self.radio_tx.borrow()
    }

    pub fn is_scanning(&self) -> bool {
        *self.scanning_tx.borrow()
    }

    pub fn is_bluetooth_enabled(&self) -> bool {
        self.radio_state() == RadioState::PoweredOn
    }

    pub fn last_connected_device(&self) -> Option<BleDevice> {
        self.reconnect.last_connected_device()
    }

    pub fn reconnect_manager(&self) -> &AutoReconnectManager {
        &self.reconnect
    }

    pub fn subscribe_devices(&self) -> watch::Receiver<Vec<BleDevice>> {
        self.devices_tx.subscribe()
    }

    pub fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection_tx.subscribe()
    }

    pub fn subscribe_device_info(&self) -> watch::Receiver<Option<DeviceInfo>> {
        self.device_info_tx.subscribe()
    }

    pub fn subscribe_reconnect_state(&self) -> watch::Receiver<ReconnectState> {
        self.reconnect.subscribe()
    }

    pub fn subscribe_radio_state(&self) -> watch::Receiver<RadioState> {
        self.radio_tx.subscribe()
    }

    pub fn subscribe_scanning(&self) -> watch::Receiver<bool> {
        self.scanning_tx.subscribe()
    }

    /// Moves to `Connecting` and asks the adapter for a session. Returns false if gated.
    async fn begin_connect(&self, device: BleDevice) -> bool {
        let accepted = self.connection_tx.send_if_modified(|state| {
            if state.is_busy() {
                false
            } else {
                *state = ConnectionState::Connecting(device.clone());
                true
            }
        });
        if !accepted {
            warn!(
                "Already connecting/connected, ignoring connect to {}",
                device.display_name()
            );
            return false;
        }

        self.manual_disconnect.store(false, Ordering::SeqCst);
        info!("Connecting to {} ({})", device.display_name(), device.id);

        if let Err(e) = self.adapter.open_session(&device.id).await {
            error!("Failed to open session to {}: {}", device.id, e);
            self.note_fault(&e);
            self.fail_pending_connect(&device.id, e.to_string());
        }
        true
    }

    /// One reconnect try: dial, then wait for the session to settle.
    async fn reconnect_attempt(&self, device: BleDevice) -> Result<bool> {
        let mut state_rx = self.connection_tx.subscribe();

        if !self.begin_connect(device.clone()).await {
            let state = state_rx.borrow();
            return Ok(state.is_connected() && state.device() == Some(&device));
        }

        let outcome = tokio::time::timeout(self.config.confirm_timeout, async {
            state_rx
                .wait_for(|state| !matches!(state, ConnectionState::Connecting(_)))
                .await
                .map(|state| state.is_connected())
        })
        .await;

        match outcome {
            Ok(Ok(connected)) => Ok(connected),
            Ok(Err(_)) => Err(anyhow!("connection state channel closed")),
            Err(_) => {
                warn!(
                    "No connection to {} within {} ms",
                    device.display_name(),
                    self.config.confirm_timeout.as_millis()
                );
                self.abandon_pending_connect(&device).await;
                Ok(false)
            }
        }
    }

    /// Cancels the retry loop along with the dial its current attempt left pending.
    async fn stop_reconnect_loop(&self) {
        let target = self.reconnect.active_target();
        self.reconnect.cancel_reconnect();
        if let Some(device) = target {
            self.abandon_pending_connect(&device).await;
        }
    }

    /// Drops a `Connecting` session that never completed so the next dial is not gated.
    async fn abandon_pending_connect(&self, device: &BleDevice) {
        let abandoned = self.connection_tx.send_if_modified(|state| match state {
            ConnectionState::Connecting(pending) if pending.id == device.id => {
                *state = ConnectionState::Disconnected;
                true
            }
            _ => false,
        });
        if abandoned {
            if let Err(e) = self.adapter.close_session().await {
                debug!("Failed to close abandoned session: {}", e);
            }
        }
    }

    fn trigger_auto_reconnect(self: &Arc<Self>) {
        if matches!(*self.connection_tx.borrow(), ConnectionState::Connecting(_)) {
            debug!("Connection attempt in flight, not starting auto-reconnect");
            return;
        }

        let manager = Arc::downgrade(self);
        self.reconnect.start_auto_reconnect(move |device| {
            let manager = manager.clone();
            async move {
                let manager = manager
                    .upgrade()
                    .ok_or_else(|| anyhow!("connection manager dropped"))?;
                manager.reconnect_attempt(device).await
            }
        });
    }

    async fn run_event_loop(manager: Weak<Self>, mut events: AdapterEventReceiver) {
        while let Some(event) = events.recv().await {
            let Some(manager) = manager.upgrade() else {
                break;
            };
            manager.handle_event(event).await;
        }
        debug!("Adapter event loop ended");
    }

    async fn handle_event(self: &Arc<Self>, event: AdapterEvent) {
        match event {
            AdapterEvent::DeviceFound(device) => self.on_device_found(device),
            AdapterEvent::ScanFailed(reason) => {
                error!("Scan failed: {}", reason);
                if let Some(timer) = lock(&self.scan_timer).take() {
                    timer.cancel();
                }
                self.scanning_tx.send_replace(false);
            }
            AdapterEvent::Connected { id } => self.on_connected(&id).await,
            AdapterEvent::Disconnected { id, error } => self.on_disconnected(&id, error).await,
            AdapterEvent::FailedToConnect { id, error } => {
                let message = error.unwrap_or_else(|| "Connection failed".to_string());
                warn!("Failed to connect to {}: {}", id, message);
                self.fail_pending_connect(&id, message);
            }
            AdapterEvent::ServicesDiscovered { services } => {
                self.on_services_discovered(&services).await
            }
            AdapterEvent::CharacteristicsDiscovered {
                service,
                characteristics,
            } => {
                self.on_characteristics_discovered(service, &characteristics)
                    .await
            }
            AdapterEvent::ValueUpdated {
                characteristic,
                value,
            } => self.on_value_updated(characteristic, &value),
            AdapterEvent::RadioStateChanged(state) => self.on_radio_state_changed(state).await,
        }
    }

    fn on_device_found(&self, device: BleDevice) {
        if !matches_scan_filter(
            &device,
            self.config.min_rssi,
            self.config.name_filter.as_deref(),
        ) {
            return;
        }
        debug!(
            "Found device - ID: {}, Name: {:?}, RSSI: {}",
            device.id, device.name, device.rssi
        );
        self.devices_tx
            .send_if_modified(|devices| upsert_device(devices, device));
    }

    async fn on_connected(&self, id: &str) {
        let mut connected = None;
        self.connection_tx.send_if_modified(|state| match state {
            ConnectionState::Connecting(pending) if pending.id == id => {
                let device = pending.clone();
                connected = Some(device.clone());
                *state = ConnectionState::Connected(device);
                true
            }
            _ => false,
        });
        let Some(device) = connected else {
            debug!("Ignoring connected event for {} with no pending attempt", id);
            return;
        };
        info!("Connected to {} ({})", device.display_name(), device.id);

        // A loop dialing this very device settles as Success through its own attempt.
        if self.reconnect.active_target().as_ref() != Some(&device) {
            self.reconnect.cancel_reconnect();
        }
        if self.auto_reconnect_enabled() {
            self.reconnect.save_last_connected_device(device.clone());
        }

        info!("Discovering services...");
        if let Err(e) = self.adapter.discover_services().await {
            warn!("Service discovery failed: {}", e);
        }
    }

    async fn on_disconnected(self: &Arc<Self>, id: &str, error: Option<String>) {
        let previous = {
            let _guard = lock(&self.transition);
            let mut previous = None;
            self.connection_tx.send_if_modified(|state| {
                if !state.device().is_some_and(|d| d.id == id) {
                    return false;
                }
                previous = Some(std::mem::replace(state, ConnectionState::Disconnected));
                true
            });
            if previous.is_some() {
                self.device_info_tx.send_replace(None);
            }
            previous
        };

        let Some(previous) = previous else {
            debug!("Ignoring disconnect event for {}", id);
            return;
        };
        match &error {
            Some(cause) => warn!("Disconnected from {}: {}", id, cause),
            None => info!("Disconnected from {}", id),
        }

        if let Err(e) = self.adapter.close_session().await {
            debug!("Failed to release session: {}", e);
        }

        if self.manual_disconnect.load(Ordering::SeqCst) {
            self.reconnect.clear_saved_device();
            return;
        }

        if previous.is_connected()
            && self.auto_reconnect_enabled()
            && self.radio_state() == RadioState::PoweredOn
        {
            info!("Unexpected disconnect, starting auto-reconnect");
            self.trigger_auto_reconnect();
        }
    }

    fn fail_pending_connect(&self, id: &str, message: String) {
        self.connection_tx.send_if_modified(|state| match state {
            ConnectionState::Connecting(pending) if pending.id == id => {
                *state = ConnectionState::Error(message);
                true
            }
            _ => false,
        });
    }

    async fn on_services_discovered(&self, services: &[Uuid]) {
        if !self.connection_tx.borrow().is_connected() {
            debug!("Ignoring service discovery without a live session");
            return;
        }
        for service in services {
            debug!("Available service: {}", service);
        }

        for service in [UUID_BATTERY_SERVICE, UUID_HEART_RATE_SERVICE] {
            if services.contains(&service) {
                if let Err(e) = self.adapter.discover_characteristics(service).await {
                    warn!("Characteristic discovery for {} failed: {}", service, e);
                }
            }
        }
    }

    async fn on_characteristics_discovered(&self, service: Uuid, characteristics: &[Uuid]) {
        if !self.connection_tx.borrow().is_connected() {
            return;
        }

        // Battery is read once; heart rate streams notifications.
        if service == UUID_BATTERY_SERVICE && characteristics.contains(&UUID_BATTERY_LEVEL) {
            info!("Reading battery level");
            if let Err(e) = self.adapter.read_characteristic(UUID_BATTERY_LEVEL).await {
                warn!("Battery level read failed: {}", e);
            }
        } else if service == UUID_HEART_RATE_SERVICE
            && characteristics.contains(&UUID_HEART_RATE_MEASUREMENT)
        {
            info!("Subscribing to heart rate notifications");
            if let Err(e) = self
                .adapter
                .set_notify(UUID_HEART_RATE_MEASUREMENT, true)
                .await
            {
                warn!("Heart rate subscription failed: {}", e);
            }
        }
    }

    fn on_value_updated(&self, characteristic: Uuid, value: &[u8]) {
        if characteristic == UUID_BATTERY_LEVEL {
            match parse_battery_level(value) {
                Some(percentage) => {
                    self.merge_device_info(|info| info.with_battery(BatteryLevel::new(percentage)))
                }
                None => debug!("Dropping malformed battery payload {:?}", value),
            }
        } else if characteristic == UUID_HEART_RATE_MEASUREMENT {
            match parse_heart_rate(value) {
                Some(hr) => self.merge_device_info(|info| {
                    info.with_heart_rate(HeartRate::new(hr.beats_per_minute, hr.sensor_contact))
                }),
                None => debug!("Dropping malformed heart rate payload {:?}", value),
            }
        } else {
            let hex = to_hex(value);
            self.merge_device_info(|info| info.with_custom_data(characteristic.to_string(), hex));
        }
    }

    /// Applies `update` to the connected device's info. Dropped when nothing is connected.
    fn merge_device_info(&self, update: impl FnOnce(DeviceInfo) -> DeviceInfo) {
        let _guard = lock(&self.transition);
        let device = match &*self.connection_tx.borrow() {
            ConnectionState::Connected(device) => device.clone(),
            _ => {
                debug!("No connected device, dropping characteristic update");
                return;
            }
        };

        self.device_info_tx.send_modify(|info| {
            let current = match info.take() {
                Some(existing) if existing.device == device => existing,
                _ => DeviceInfo::new(device),
            };
            *info = Some(update(current));
        });
    }

    async fn on_radio_state_changed(self: &Arc<Self>, state: RadioState) {
        let previous = self.radio_tx.send_replace(state);
        if previous == state {
            return;
        }
        info!("Bluetooth state: {:?} -> {:?}", previous, state);

        match state {
            RadioState::PoweredOn => {
                if self.auto_reconnect_enabled() && previous == RadioState::PoweredOff {
                    self.trigger_auto_reconnect();
                }
            }
            RadioState::PoweredOff => {
                let connected = match &*self.connection_tx.borrow() {
                    ConnectionState::Connected(device) => Some(device.id.clone()),
                    _ => None,
                };
                if let Some(id) = connected {
                    self.on_disconnected(&id, Some("Bluetooth powered off".to_string()))
                        .await;
                }
                self.stop_reconnect_loop().await;
                self.stop_scan().await;
            }
            _ => {}
        }
    }

    fn note_fault(&self, err: &BleError) {
        if *err == BleError::Unauthorized {
            self.radio_tx.send_replace(RadioState::Unauthorized);
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.scan_timer).take() {
            timer.cancel();
        }
        if let Some(handle) = lock(&self.event_task).take() {
            handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
