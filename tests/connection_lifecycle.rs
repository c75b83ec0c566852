//! End-to-end connection lifecycle against the simulated adapter.

use std::sync::Arc;
use std::time::Duration;

use ble_vitals_monitor_lib::core::bluetooth::{
    event_channel, AdapterCall, BleDevice, ConnectionManager, ConnectionState, ManagerConfig,
    RadioState, ReconnectState, SimulatedAdapter, SimulatedPeripheral, UUID_BATTERY_LEVEL,
    UUID_HEART_RATE_MEASUREMENT,
};
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

const STRAP_ID: &str = "C4:7C:8D:6A:12:01";
const CHEST_ID: &str = "E2:11:4B:90:3F:7C";

fn strap() -> SimulatedPeripheral {
    SimulatedPeripheral::new(STRAP_ID, Some("Polar H10"), -58)
        .with_battery(87)
        .with_heart_rate(vec![0x06, 68])
}

fn chest() -> SimulatedPeripheral {
    SimulatedPeripheral::new(CHEST_ID, Some("TICKR"), -71)
        .with_battery(42)
        .with_heart_rate(vec![0x01, 0x48, 0x00])
}

fn device(peripheral: &SimulatedPeripheral) -> BleDevice {
    peripheral.device.clone()
}

async fn setup(config: ManagerConfig) -> (Arc<ConnectionManager>, Arc<SimulatedAdapter>) {
    let (tx, rx) = event_channel();
    let adapter = Arc::new(SimulatedAdapter::new(tx, vec![strap(), chest()]));
    let manager = ConnectionManager::new(adapter.clone(), rx, config).await;
    (manager, adapter)
}

async fn wait_until<T: Clone>(rx: &mut watch::Receiver<T>, predicate: impl FnMut(&T) -> bool) -> T {
    tokio::time::timeout(Duration::from_secs(600), rx.wait_for(predicate))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed")
        .clone()
}

async fn connect_and_settle(manager: &Arc<ConnectionManager>, target: BleDevice) {
    let mut info = manager.subscribe_device_info();
    manager.connect(target).await;
    wait_until(&mut info, |info| {
        info.as_ref()
            .is_some_and(|i| i.battery_level.is_some() && i.heart_rate.is_some())
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn scan_collects_devices_and_times_out() {
    let (manager, adapter) = setup(ManagerConfig::default()).await;
    let mut devices = manager.subscribe_devices();
    let mut scanning = manager.subscribe_scanning();

    manager.start_scan().await;
    assert!(manager.is_scanning());
    let found = wait_until(&mut devices, |d| d.len() == 2).await;
    assert!(found.contains(&device(&strap())));
    assert!(found.contains(&device(&chest())));

    // a second start while scanning is a no-op
    manager.start_scan().await;
    assert_eq!(adapter.count_calls(&AdapterCall::StartScan), 1);

    let started = Instant::now();
    wait_until(&mut scanning, |s| !*s).await;
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(adapter.count_calls(&AdapterCall::StopScan), 1);
    assert!(!adapter.is_scanning());

    // restarting clears and refills without duplicates
    manager.start_scan().await;
    wait_until(&mut devices, |d| d.len() == 2).await;
    assert_eq!(manager.scanned_devices().len(), 2);
}

#[tokio::test]
async fn scan_respects_filters() {
    let config = ManagerConfig {
        name_filter: Some("polar".to_string()),
        ..ManagerConfig::default()
    };
    let (manager, _adapter) = setup(config).await;
    let mut devices = manager.subscribe_devices();

    manager.start_scan().await;
    let found = wait_until(&mut devices, |d| !d.is_empty()).await;
    assert_eq!(found, vec![device(&strap())]);
    manager.stop_scan().await;
    assert!(!manager.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn manual_stop_cancels_scan_timer() {
    let (manager, _adapter) = setup(ManagerConfig::default()).await;
    let mut scanning = manager.subscribe_scanning();

    manager.start_scan().await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    manager.stop_scan().await;
    assert!(!manager.is_scanning());

    let restarted_at = Instant::now();
    manager.start_scan().await;

    // the first scan's timer would have fired at 10 s
    tokio::time::sleep(Duration::from_secs(9)).await;
    assert!(manager.is_scanning());

    wait_until(&mut scanning, |s| !*s).await;
    let elapsed = restarted_at.elapsed();
    assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));
}

#[tokio::test]
async fn connect_reads_battery_and_streams_heart_rate() {
    let (manager, adapter) = setup(ManagerConfig::default()).await;

    connect_and_settle(&manager, device(&strap())).await;

    assert_eq!(
        manager.connection_state(),
        ConnectionState::Connected(device(&strap()))
    );
    let info = manager.device_info().unwrap();
    assert_eq!(info.device, device(&strap()));
    assert_eq!(info.battery_level.unwrap().percentage, 87);
    let heart_rate = info.heart_rate.unwrap();
    assert_eq!(heart_rate.beats_per_minute, 68);
    assert_eq!(heart_rate.sensor_contact, Some(true));

    let calls = adapter.calls();
    assert!(calls.contains(&AdapterCall::OpenSession(STRAP_ID.to_string())));
    assert!(calls.contains(&AdapterCall::DiscoverServices));
    assert!(calls.contains(&AdapterCall::ReadCharacteristic(UUID_BATTERY_LEVEL)));
    assert!(calls.contains(&AdapterCall::SetNotify(UUID_HEART_RATE_MEASUREMENT, true)));
    assert_eq!(manager.last_connected_device(), Some(device(&strap())));
}

#[tokio::test]
async fn notifications_merge_into_device_info() {
    let (manager, adapter) = setup(ManagerConfig::default()).await;
    connect_and_settle(&manager, device(&strap())).await;
    let mut info = manager.subscribe_device_info();

    adapter.push_value(UUID_HEART_RATE_MEASUREMENT, vec![0x01, 0x2C, 0x01]);
    let updated = wait_until(&mut info, |i| {
        i.as_ref()
            .and_then(|i| i.heart_rate.as_ref())
            .is_some_and(|hr| hr.beats_per_minute == 300)
    })
    .await
    .unwrap();
    assert_eq!(updated.battery_level.unwrap().percentage, 87);
    assert_eq!(updated.heart_rate.unwrap().sensor_contact, None);

    // truncated payloads change nothing
    adapter.push_value(UUID_HEART_RATE_MEASUREMENT, vec![0x01, 0x2C]);
    let other = Uuid::from_u128(0x00002a29_0000_1000_8000_00805f9b34fb);
    adapter.push_value(other, vec![0xde, 0xad]);
    let updated = wait_until(&mut info, |i| {
        i.as_ref().is_some_and(|i| !i.custom_data.is_empty())
    })
    .await
    .unwrap();
    assert_eq!(
        updated.custom_data.get(&other.to_string()).map(String::as_str),
        Some("dead")
    );
    assert_eq!(updated.heart_rate.unwrap().beats_per_minute, 300);
}

#[tokio::test]
async fn connect_while_busy_is_ignored() {
    let (manager, adapter) = setup(ManagerConfig::default()).await;

    manager.connect(device(&strap())).await;
    manager.connect(device(&chest())).await;

    let mut state = manager.subscribe_connection_state();
    let settled = wait_until(&mut state, |s| s.is_connected()).await;
    assert_eq!(settled.device(), Some(&device(&strap())));
    assert_eq!(
        adapter.count_calls(&AdapterCall::OpenSession(CHEST_ID.to_string())),
        0
    );
}

#[tokio::test]
async fn unknown_device_ends_in_error() {
    let (manager, _adapter) = setup(ManagerConfig::default()).await;

    manager
        .connect(BleDevice::new("00:00:00:00:00:00", None, -40))
        .await;
    assert!(matches!(
        manager.connection_state(),
        ConnectionState::Error(_)
    ));

    // an error does not gate the next attempt
    connect_and_settle(&manager, device(&chest())).await;
}

#[tokio::test(start_paused = true)]
async fn manual_disconnect_clears_everything() {
    let (manager, adapter) = setup(ManagerConfig::default()).await;
    connect_and_settle(&manager, device(&strap())).await;

    manager.disconnect().await;

    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    assert_eq!(manager.device_info(), None);
    assert_eq!(manager.reconnect_state(), ReconnectState::Idle);
    assert_eq!(manager.last_connected_device(), None);
    assert_eq!(adapter.count_calls(&AdapterCall::CloseSession), 1);

    // the late disconnect callback must not start a reconnect
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(
        adapter.count_calls(&AdapterCall::OpenSession(STRAP_ID.to_string())),
        1
    );
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn unexpected_drop_reconnects_with_backoff() {
    let (manager, adapter) = setup(ManagerConfig::default()).await;
    connect_and_settle(&manager, device(&strap())).await;
    let mut reconnect = manager.subscribe_reconnect_state();

    adapter.fail_next_connects(STRAP_ID, 2);
    let dropped_at = Instant::now();
    adapter.drop_connection("out of range");

    let mut attempts = Vec::new();
    let outcome = loop {
        let state = wait_until(&mut reconnect, |s| match s {
            ReconnectState::Reconnecting { attempt, .. } => !attempts.contains(attempt),
            ReconnectState::Success { .. } | ReconnectState::Failed { .. } => true,
            ReconnectState::Idle => false,
        })
        .await;
        match state {
            ReconnectState::Reconnecting { attempt, max_attempts, .. } => {
                assert_eq!(max_attempts, 5);
                attempts.push(attempt);
            }
            other => break other,
        }
    };

    assert_eq!(
        outcome,
        ReconnectState::Success {
            device: device(&strap())
        }
    );
    assert_eq!(attempts, vec![1, 2, 3]);
    // 1 s + 2 s + 4 s of backoff before the third attempt
    let elapsed = dropped_at.elapsed();
    assert!(elapsed >= Duration::from_secs(7) && elapsed < Duration::from_secs(8));

    let mut state = manager.subscribe_connection_state();
    wait_until(&mut state, |s| s.is_connected()).await;
    assert_eq!(
        adapter.count_calls(&AdapterCall::OpenSession(STRAP_ID.to_string())),
        4
    );
}

#[tokio::test(start_paused = true)]
async fn unreachable_device_exhausts_attempts() {
    let (manager, adapter) = setup(ManagerConfig::default()).await;
    connect_and_settle(&manager, device(&strap())).await;
    let mut reconnect = manager.subscribe_reconnect_state();

    adapter.set_reachable(STRAP_ID, false);
    adapter.drop_connection("out of range");

    let outcome = wait_until(&mut reconnect, |s| matches!(s, ReconnectState::Failed { .. })).await;
    match outcome {
        ReconnectState::Failed { device: failed, reason } => {
            assert_eq!(failed, device(&strap()));
            assert!(reason.contains("5 attempts"), "{}", reason);
        }
        other => panic!("unexpected state {:?}", other),
    }
    assert_eq!(
        adapter.count_calls(&AdapterCall::OpenSession(STRAP_ID.to_string())),
        6
    );
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn disabled_auto_reconnect_stays_down() {
    let (manager, adapter) = setup(ManagerConfig::default()).await;
    manager.enable_auto_reconnect(false).await;
    connect_and_settle(&manager, device(&strap())).await;

    adapter.drop_connection("out of range");
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    assert_eq!(manager.reconnect_state(), ReconnectState::Idle);
    assert_eq!(
        adapter.count_calls(&AdapterCall::OpenSession(STRAP_ID.to_string())),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn user_connect_cancels_running_reconnect() {
    let (manager, adapter) = setup(ManagerConfig::default()).await;
    connect_and_settle(&manager, device(&strap())).await;
    let mut reconnect = manager.subscribe_reconnect_state();

    adapter.set_reachable(STRAP_ID, false);
    adapter.drop_connection("out of range");
    wait_until(&mut reconnect, |s| matches!(s, ReconnectState::Reconnecting { .. })).await;

    connect_and_settle(&manager, device(&chest())).await;
    assert_eq!(manager.reconnect_state(), ReconnectState::Idle);
    assert!(!manager.reconnect_manager().is_running());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(
        manager.connection_state(),
        ConnectionState::Connected(device(&chest()))
    );
    assert_eq!(
        adapter.count_calls(&AdapterCall::OpenSession(STRAP_ID.to_string())),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn disabling_auto_reconnect_mid_dial_releases_the_attempt() {
    let (manager, adapter) = setup(ManagerConfig::default()).await;
    connect_and_settle(&manager, device(&strap())).await;
    let mut state = manager.subscribe_connection_state();

    adapter.set_reachable(STRAP_ID, false);
    adapter.drop_connection("out of range");
    // first attempt starts dialing after the 1 s backoff
    wait_until(&mut state, |s| matches!(s, ConnectionState::Connecting(_))).await;

    manager.enable_auto_reconnect(false).await;
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    assert_eq!(manager.reconnect_state(), ReconnectState::Idle);
    assert!(!manager.reconnect_manager().is_running());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);

    connect_and_settle(&manager, device(&chest())).await;
    assert_eq!(
        manager.connection_state(),
        ConnectionState::Connected(device(&chest()))
    );
    assert_eq!(
        adapter.count_calls(&AdapterCall::OpenSession(STRAP_ID.to_string())),
        2
    );
}

#[tokio::test(start_paused = true)]
async fn radio_power_cycle_reconnects() {
    let (manager, adapter) = setup(ManagerConfig::default()).await;
    connect_and_settle(&manager, device(&strap())).await;
    let mut radio = manager.subscribe_radio_state();
    let mut state = manager.subscribe_connection_state();

    adapter.set_radio_state(RadioState::PoweredOff);
    wait_until(&mut radio, |r| *r == RadioState::PoweredOff).await;
    wait_until(&mut state, |s| *s == ConnectionState::Disconnected).await;
    assert!(!manager.is_bluetooth_enabled());
    assert_eq!(manager.device_info(), None);

    // nothing is retried while the radio is off
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(manager.reconnect_state(), ReconnectState::Idle);

    adapter.set_radio_state(RadioState::PoweredOn);
    let mut reconnect = manager.subscribe_reconnect_state();
    wait_until(&mut reconnect, |s| matches!(s, ReconnectState::Success { .. })).await;
    assert_eq!(
        manager.connection_state(),
        ConnectionState::Connected(device(&strap()))
    );
}

#[tokio::test]
async fn unauthorized_scan_publishes_radio_state() {
    let (tx, rx) = event_channel();
    let adapter = Arc::new(SimulatedAdapter::new(tx, vec![strap()]));
    adapter.set_radio_state(RadioState::Unauthorized);
    let manager = ConnectionManager::new(adapter.clone(), rx, ManagerConfig::default()).await;

    manager.start_scan().await;
    assert!(!manager.is_scanning());
    assert_eq!(manager.radio_state(), RadioState::Unauthorized);
    assert!(manager.scanned_devices().is_empty());
}
