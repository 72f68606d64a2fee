//! End-to-end behaviour of the running monitor against a fake inverter.

mod common;

use std::time::Duration;

use common::{fast_options, free_port, refresh_until, seed_registers, store_for, FakeDevice};
use inverter_monitor::{
    ConfigStore, ConnectionConfig, DeviceHealth, FieldValue, Monitor, MonitorError,
};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_sample_decodes_every_field() {
    let device = FakeDevice::start().await;
    seed_registers(&device);
    let dir = tempfile::tempdir().unwrap();

    let monitor = Monitor::start(store_for(dir.path(), device.config()).await, fast_options());
    let mut viewer = monitor.subscribe();
    assert!(monitor.client().wait_connected(WAIT).await);

    let sample = refresh_until(&monitor, &mut viewer, WAIT, |_| true)
        .await
        .expect("no sample published");

    assert_eq!(sample.value("ppv1"), Some(1200.0));
    assert_eq!(sample.value("ac_active_power"), Some(-500.0));
    assert_eq!(sample.value("vbattery"), Some(523.4));
    assert_eq!(sample.value("ibattery"), Some(-2.0));
    assert_eq!(sample.value("pbattery"), Some(-1000.0));
    assert_eq!(sample.value("pv_energy_day"), Some(12.3));
    assert_eq!(sample.value("bms_temperature"), Some(25.1));
    assert_eq!(sample.value("battery_soc"), Some(55.0));
    assert_eq!(sample.value("grid_export_limit"), Some(10000.0));
    assert_eq!(sample.available_count(), 15);
    assert_eq!(monitor.health(), DeviceHealth::Online);

    let json: serde_json::Value = serde_json::from_str(&sample.to_json().unwrap()).unwrap();
    assert_eq!(json["type"], "update");
    assert_eq!(json["data"]["battery_soc"], 55.0);

    monitor.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_at_startup_then_recovers() {
    let port = free_port();
    let dir = tempfile::tempdir().unwrap();
    let config = ConnectionConfig::new("127.0.0.1", port, 1);

    let monitor = Monitor::start(store_for(dir.path(), config).await, fast_options());
    let mut viewer = monitor.subscribe();

    for _ in 0..3 {
        monitor.refresh();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(monitor.latest().is_none());
    assert!(!viewer.has_update());
    assert!(!monitor.connection_state().is_connected());
    assert_eq!(monitor.health(), DeviceHealth::Unreachable);

    let device = FakeDevice::start_on(port).await;
    seed_registers(&device);

    let sample = refresh_until(&monitor, &mut viewer, WAIT, |_| true)
        .await
        .expect("monitor never recovered");
    assert_eq!(sample.update_count, 1);
    assert_eq!(sample.value("battery_soc"), Some(55.0));
    assert_eq!(monitor.health(), DeviceHealth::Online);

    monitor.shutdown().await;
}

#[tokio::test]
async fn test_config_switch_moves_to_new_device() {
    let a = FakeDevice::start().await;
    seed_registers(&a);
    a.set_register(37007, 40);
    let b = FakeDevice::start().await;
    seed_registers(&b);
    b.set_register(37007, 80);

    let dir = tempfile::tempdir().unwrap();
    let monitor = Monitor::start(store_for(dir.path(), a.config()).await, fast_options());
    let mut viewer = monitor.subscribe();

    let from_a = refresh_until(&monitor, &mut viewer, WAIT, |s| {
        s.value("battery_soc") == Some(40.0)
    })
    .await;
    assert!(from_a.is_some());

    let applied = monitor.update_config(b.config()).await.unwrap();
    assert_eq!(applied, b.config());
    assert_eq!(monitor.config().effective_config(), b.config());

    let from_b = refresh_until(&monitor, &mut viewer, WAIT, |s| {
        s.value("battery_soc") == Some(80.0)
    })
    .await;
    assert!(from_b.is_some());
    assert!(common::eventually(WAIT, || a.open_connections() == 0).await);

    let requests_to_a = a.request_count();
    monitor.refresh();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(a.request_count(), requests_to_a);

    let reloaded = ConfigStore::load(dir.path(), ConnectionConfig::default()).await;
    assert_eq!(reloaded.effective_config(), b.config());

    monitor.shutdown().await;
}

#[tokio::test]
async fn test_write_refreshes_live_sample() {
    let device = FakeDevice::start().await;
    seed_registers(&device);
    let dir = tempfile::tempdir().unwrap();

    let monitor = Monitor::start(store_for(dir.path(), device.config()).await, fast_options());
    let mut viewer = monitor.subscribe();
    let before = refresh_until(&monitor, &mut viewer, WAIT, |s| {
        s.value("grid_export_limit") == Some(10000.0)
    })
    .await;
    assert!(before.is_some());

    let outcome = monitor
        .gateway()
        .write("GridExportLimit", 5000)
        .await
        .unwrap();
    assert_eq!(outcome.field, "grid_export_limit");
    assert_eq!(outcome.raw, vec![5000]);
    assert!(outcome.is_verified());
    assert_eq!(device.register(47510), 5000);

    // No manual refresh: the write itself triggers the poll.
    let after = common::next_matching(&mut viewer, Duration::from_secs(2), |s| {
        s.value("grid_export_limit") == Some(5000.0)
    })
    .await;
    assert!(after.is_some());

    let writes = device.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].function, 0x06);
    assert_eq!(writes[0].address, 47510);

    monitor.shutdown().await;
}

#[tokio::test]
async fn test_negative_setting_round_trip() {
    let device = FakeDevice::start().await;
    seed_registers(&device);
    let dir = tempfile::tempdir().unwrap();

    let monitor = Monitor::start(store_for(dir.path(), device.config()).await, fast_options());
    assert!(monitor.client().wait_connected(WAIT).await);

    let outcome = monitor
        .gateway()
        .write("meter_target_power_offset", -500)
        .await
        .unwrap();
    assert_eq!(outcome.raw, vec![0xFE0C]);
    assert_eq!(outcome.verified_value, Some(-500.0));
    assert_eq!(device.register(47120), 0xFE0C);

    let settings = monitor.gateway().read_settings().await;
    assert_eq!(settings["meter_target_power_offset"], Some(-500.0));
    assert_eq!(settings["grid_export_limit"], Some(10000.0));

    monitor.shutdown().await;
}

#[tokio::test]
async fn test_invalid_writes_never_reach_device() {
    let device = FakeDevice::start().await;
    seed_registers(&device);
    let dir = tempfile::tempdir().unwrap();

    let monitor = Monitor::start(store_for(dir.path(), device.config()).await, fast_options());
    assert!(monitor.client().wait_connected(WAIT).await);
    let gateway = monitor.gateway();

    assert!(matches!(
        gateway.write("grid_export_limit", 70_000).await,
        Err(MonitorError::OutOfRange { .. })
    ));
    assert!(matches!(
        gateway.write("meter_target_power_offset", 40_000).await,
        Err(MonitorError::OutOfRange { .. })
    ));
    assert!(matches!(
        gateway.write("battery_soc", 10).await,
        Err(MonitorError::NotWritable { .. })
    ));
    assert!(matches!(
        gateway.write("flux_capacitor", 1).await,
        Err(MonitorError::UnknownField { .. })
    ));

    assert!(device.writes().is_empty());
    assert_eq!(device.register(47510), 10000);

    monitor.shutdown().await;
}

#[tokio::test]
async fn test_rejected_write_is_reported() {
    let device = FakeDevice::start().await;
    seed_registers(&device);
    device.reject_address(47510);
    let dir = tempfile::tempdir().unwrap();

    let monitor = Monitor::start(store_for(dir.path(), device.config()).await, fast_options());
    assert!(monitor.client().wait_connected(WAIT).await);

    let err = monitor
        .gateway()
        .write("grid_export_limit", 3000)
        .await
        .unwrap_err();
    assert!(matches!(err, MonitorError::Rejected { function: 0x06, code: 0x02, .. }));
    assert!(monitor.client().is_connected());

    monitor.shutdown().await;
}

#[tokio::test]
async fn test_timeout_degrades_fields_and_polling_continues() {
    let device = FakeDevice::start().await;
    seed_registers(&device);
    device.silence_address(37007);
    let dir = tempfile::tempdir().unwrap();

    let monitor = Monitor::start(store_for(dir.path(), device.config()).await, fast_options());
    let mut viewer = monitor.subscribe();

    let first = refresh_until(&monitor, &mut viewer, WAIT, |_| true)
        .await
        .expect("no sample published");
    assert_eq!(first.value("ppv1"), Some(1200.0));
    assert_eq!(first.value("bms_temperature"), Some(25.1));
    assert_eq!(first.get("battery_soc"), Some(FieldValue::Unavailable));
    // Blocks after the timed-out one are read on the new connection.
    assert_eq!(first.value("meter_target_power_offset"), Some(0.0));
    assert_eq!(first.value("grid_export_limit"), Some(10000.0));
    assert_eq!(first.available_count(), 14);

    let first_count = first.update_count;
    let second = refresh_until(&monitor, &mut viewer, WAIT, |s| s.update_count > first_count)
        .await
        .expect("polling stopped after a timeout");
    assert_eq!(second.value("ppv1"), Some(1200.0));
    assert_eq!(second.get("battery_soc"), Some(FieldValue::Unavailable));
    assert_eq!(second.value("grid_export_limit"), Some(10000.0));
    assert_eq!(second.available_count(), 14);

    monitor.shutdown().await;
}

#[tokio::test]
async fn test_malformed_response_degrades_only_its_field() {
    let device = FakeDevice::start().await;
    seed_registers(&device);
    device.corrupt_address(37007);
    let dir = tempfile::tempdir().unwrap();

    let monitor = Monitor::start(store_for(dir.path(), device.config()).await, fast_options());
    let mut viewer = monitor.subscribe();

    let first = refresh_until(&monitor, &mut viewer, WAIT, |_| true)
        .await
        .expect("no sample published");
    assert_eq!(first.get("battery_soc"), Some(FieldValue::Unavailable));
    assert_eq!(first.value("bms_temperature"), Some(25.1));
    assert_eq!(first.value("grid_export_limit"), Some(10000.0));
    assert_eq!(first.available_count(), 14);

    let first_count = first.update_count;
    let second = refresh_until(&monitor, &mut viewer, WAIT, |s| s.update_count > first_count)
        .await
        .expect("polling stopped after a malformed response");
    assert_eq!(second.get("battery_soc"), Some(FieldValue::Unavailable));
    assert_eq!(second.available_count(), 14);
    assert_eq!(device.connection_count(), 1);

    monitor.shutdown().await;
}

#[tokio::test]
async fn test_rejected_block_falls_back_to_single_fields() {
    let device = FakeDevice::start().await;
    seed_registers(&device);
    // 35182 sits in the battery block together with vbattery and ibattery.
    device.reject_address(35182);
    let dir = tempfile::tempdir().unwrap();

    let monitor = Monitor::start(store_for(dir.path(), device.config()).await, fast_options());
    let mut viewer = monitor.subscribe();

    let sample = refresh_until(&monitor, &mut viewer, WAIT, |_| true)
        .await
        .expect("no sample published");
    assert_eq!(sample.get("pbattery"), Some(FieldValue::Unavailable));
    assert_eq!(sample.value("vbattery"), Some(523.4));
    assert_eq!(sample.value("ibattery"), Some(-2.0));
    assert_eq!(sample.value("battery_soc"), Some(55.0));
    assert_eq!(sample.available_count(), 14);

    monitor.shutdown().await;
}
