use fleet_devkit::{fixture_device, validate_command, CommandBuilder, TestHarness};
use fleet_kernel::config::SimulationConf;
use fleet_kernel::models::{DeviceRecord, DeviceStatus, FirmwarePhase, SimulatedStatus};
use fleet_kernel::supervisor::SupervisorError;
use serde_json::{json, Value};
use std::time::Duration;

fn fleet() -> Vec<DeviceRecord> {
    let mut online = fixture_device(2, "SN-002");
    online.status = DeviceStatus::Online;
    online.firmware_version = Some("1.4.0".into());
    vec![fixture_device(1, "SN-001"), online]
}

#[tokio::test(start_paused = true)]
async fn every_device_comes_up_online() {
    let harness = TestHarness::new(fleet()).await.unwrap();

    assert_eq!(harness.supervisor.simulator_count(), 2);
    for serial in ["SN-001", "SN-002"] {
        assert_eq!(harness.snapshot(serial).unwrap().status, SimulatedStatus::Online);
    }
    assert_eq!(harness.snapshot("SN-001").unwrap().firmware_version, "1.0.0");
    assert_eq!(harness.snapshot("SN-002").unwrap().firmware_version, "1.4.0");
    assert_eq!(
        harness.bus.get_subscriptions(),
        vec!["devices/SN-001/commands", "devices/SN-002/commands"]
    );
}

#[tokio::test(start_paused = true)]
async fn restart_takes_exactly_the_command_delay() {
    let harness = TestHarness::new(fleet()).await.unwrap();

    harness.send_command(1, "restart", None).await.unwrap();
    assert_eq!(harness.snapshot("SN-001").unwrap().status, SimulatedStatus::Restarting);
    assert_eq!(harness.snapshot("SN-002").unwrap().status, SimulatedStatus::Online);

    harness.advance(Duration::from_millis(2999)).await;
    assert_eq!(harness.snapshot("SN-001").unwrap().status, SimulatedStatus::Restarting);

    harness.advance(Duration::from_millis(1)).await;
    assert_eq!(harness.snapshot("SN-001").unwrap().status, SimulatedStatus::Online);
}

#[tokio::test(start_paused = true)]
async fn second_restart_extends_the_window() {
    let harness = TestHarness::new(fleet()).await.unwrap();

    harness.send_command(1, "restart", None).await.unwrap();
    harness.advance(Duration::from_secs(2)).await;
    harness.send_command(1, "restart", None).await.unwrap();

    harness.advance(Duration::from_secs(2)).await;
    assert_eq!(harness.snapshot("SN-001").unwrap().status, SimulatedStatus::Restarting);

    harness.advance(Duration::from_secs(1)).await;
    assert_eq!(harness.snapshot("SN-001").unwrap().status, SimulatedStatus::Online);
}

#[tokio::test(start_paused = true)]
async fn firmware_update_without_version_is_ignored() {
    let harness = TestHarness::new(fleet()).await.unwrap();
    let before = harness.snapshot("SN-001").unwrap();

    harness.send_command(1, "updateFirmware", None).await.unwrap();
    harness.send_command(1, "updateFirmware", Some(json!({"version": ""}))).await.unwrap();

    let after = harness.snapshot("SN-001").unwrap();
    assert_eq!(after, before);
    assert_eq!(after.firmware, FirmwarePhase::Idle);

    harness.advance(Duration::from_secs(4)).await;
    assert_eq!(harness.snapshot("SN-001").unwrap(), before);
}

#[tokio::test(start_paused = true)]
async fn firmware_update_commits_after_delay() {
    let harness = TestHarness::new(fleet()).await.unwrap();

    let receipt = harness
        .send_command(1, "updateFirmware", Some(json!({"version": "2.1.0"})))
        .await
        .unwrap();
    assert_eq!(receipt.message, "Command sent");
    assert_eq!(harness.snapshot("SN-001").unwrap().firmware_version, "1.0.0");
    assert_eq!(harness.snapshot("SN-001").unwrap().firmware, FirmwarePhase::Updating);

    harness.advance(Duration::from_millis(2999)).await;
    assert_eq!(harness.snapshot("SN-001").unwrap().firmware_version, "1.0.0");

    harness.advance(Duration::from_millis(1)).await;
    let snapshot = harness.snapshot("SN-001").unwrap();
    assert_eq!(snapshot.firmware_version, "2.1.0");
    assert_eq!(snapshot.firmware, FirmwarePhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn telemetry_follows_the_configured_cadence() {
    let settings = SimulationConf { telemetry_interval_ms: 1000, ..SimulationConf::default() };
    let harness = TestHarness::with_settings(fleet(), settings).await.unwrap();

    harness.advance(Duration::from_millis(999)).await;
    assert!(harness.telemetry_for("SN-001").unwrap().is_empty());

    for _ in 0..4 {
        harness.advance(Duration::from_millis(1)).await;
        harness.advance(Duration::from_millis(999)).await;
    }

    for serial in ["SN-001", "SN-002"] {
        let samples = harness.telemetry_for(serial).unwrap();
        assert_eq!(samples.len(), 4, "{}", serial);
        assert!(samples.iter().all(|s| s.status == DeviceStatus::Online));
        assert!(samples.iter().all(|s| s.metrics.cpu <= 100 && s.metrics.memory <= 100));
    }
    assert_eq!(harness.telemetry_for("SN-002").unwrap()[0].firmware_version, "1.4.0");
}

#[tokio::test(start_paused = true)]
async fn telemetry_reports_offline_while_restarting() {
    let settings = SimulationConf { telemetry_interval_ms: 1000, ..SimulationConf::default() };
    let harness = TestHarness::with_settings(fleet(), settings).await.unwrap();

    harness.send_command(1, "restart", None).await.unwrap();
    harness.advance(Duration::from_secs(1)).await;
    harness.advance(Duration::from_secs(1)).await;

    let samples = harness.telemetry_for("SN-001").unwrap();
    assert_eq!(samples.len(), 2);
    assert!(samples.iter().all(|s| s.status == DeviceStatus::Offline));
    assert_eq!(harness.telemetry_for("SN-002").unwrap()[1].status, DeviceStatus::Online);
}

#[tokio::test(start_paused = true)]
async fn unrecognized_and_malformed_commands_are_harmless() {
    let harness = TestHarness::new(fleet()).await.unwrap();
    let before = harness.snapshot("SN-001").unwrap();

    harness.send_command(1, "selfdestruct", None).await.unwrap();
    harness.send_raw("SN-001", "{not json").await.unwrap();
    harness.send_raw("SN-001", r#"{"payload":{}}"#).await.unwrap();
    assert_eq!(harness.snapshot("SN-001").unwrap(), before);

    harness.advance(Duration::from_secs(5)).await;
    let samples = harness.telemetry_for("SN-001").unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].status, DeviceStatus::Online);

    // the simulator still reacts afterwards
    harness.send_command(1, "restart", None).await.unwrap();
    assert_eq!(harness.snapshot("SN-001").unwrap().status, SimulatedStatus::Restarting);
}

#[tokio::test(start_paused = true)]
async fn unknown_device_fails_and_publishes_nothing() {
    let harness = TestHarness::new(fleet()).await.unwrap();

    let result = harness.send_command(99, "restart", None).await;
    let err = result.unwrap_err();
    assert!(matches!(err.downcast_ref::<SupervisorError>(), Some(SupervisorError::UnknownDevice(99))));
    assert_eq!(harness.get_stats().total_messages, 0);
}

#[tokio::test(start_paused = true)]
async fn published_commands_match_the_wire_format() {
    let harness = TestHarness::new(fleet()).await.unwrap();

    harness.send_command(2, "restart", None).await.unwrap();
    harness
        .send_command(2, "updateFirmware", Some(json!({"version": "3.0.0"})))
        .await
        .unwrap();

    let messages = harness.bus.find_messages_by_topic("devices/SN-002/commands");
    assert_eq!(messages.len(), 2);
    for message in &messages {
        let body: Value = serde_json::from_slice(&message.payload).unwrap();
        validate_command(&body).unwrap();
    }
    harness
        .assert_field_equals("devices/SN-002/commands", "payload.version", &json!("3.0.0"))
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn raw_commands_from_other_publishers_are_handled() {
    let harness = TestHarness::new(fleet()).await.unwrap();

    let body = CommandBuilder::update_firmware("9.9.9").with_timestamp().to_bytes().unwrap();
    harness.send_raw("SN-002", body).await.unwrap();
    harness.advance(Duration::from_secs(3)).await;

    assert_eq!(harness.snapshot("SN-002").unwrap().firmware_version, "9.9.9");
}

#[tokio::test(start_paused = true)]
async fn command_is_retried_across_a_short_outage() {
    let harness = TestHarness::new(fleet()).await.unwrap();
    harness.bus.simulate_disconnect();

    let bus = harness.bus.clone();
    let reconnect = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        bus.simulate_reconnect();
    });

    let receipt = harness.send_command(1, "restart", None).await.unwrap();
    reconnect.await.unwrap();

    assert_eq!(receipt.cmd.command, "restart");
    assert_eq!(harness.bus.rejected_publishes(), 2);
    assert_eq!(harness.bus.find_messages_by_topic("devices/SN-001/commands").len(), 1);
    assert_eq!(harness.snapshot("SN-001").unwrap().status, SimulatedStatus::Restarting);
}

#[tokio::test(start_paused = true)]
async fn long_outage_is_logged_not_surfaced() {
    let harness = TestHarness::new(fleet()).await.unwrap();
    harness.bus.simulate_disconnect();

    assert!(harness.send_command(1, "restart", None).await.is_ok());
    assert_eq!(harness.bus.rejected_publishes(), 3);
    assert_eq!(harness.snapshot("SN-001").unwrap().status, SimulatedStatus::Online);

    // telemetry resumes once the link is back
    harness.bus.simulate_reconnect();
    harness.advance(Duration::from_secs(5)).await;
    assert_eq!(harness.telemetry_for("SN-001").unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn removed_device_stops_reporting() {
    let harness = TestHarness::new(fleet()).await.unwrap();

    assert!(harness.supervisor.remove_device(1).await.unwrap());
    assert_eq!(harness.bus.active_subscriptions(), 1);

    harness.advance(Duration::from_secs(5)).await;
    assert!(harness.telemetry_for("SN-001").unwrap().is_empty());
    assert_eq!(harness.telemetry_for("SN-002").unwrap().len(), 1);

    harness.shutdown().await;
    assert_eq!(harness.bus.active_subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn device_added_at_runtime_joins_the_fleet() {
    let harness = TestHarness::new(vec![]).await.unwrap();
    let record = fixture_device(7, "SN-007");
    harness.directory.insert(record.clone());

    let snapshot = harness.supervisor.start_device(&record).await.unwrap();
    assert_eq!(snapshot.status, SimulatedStatus::Online);

    harness.send_command(7, "restart", None).await.unwrap();
    assert_eq!(harness.snapshot("SN-007").unwrap().status, SimulatedStatus::Restarting);
}
