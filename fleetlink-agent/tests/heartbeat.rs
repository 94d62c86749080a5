use chrono::Utc;
use fleetlink_agent::config::HardwareScope;
use fleetlink_agent::dispatcher::TransportError;
use fleetlink_agent::heartbeat::HeartbeatError;
use fleetlink_agent::models::{EventInfo, HardwareInfo, Interface};
use fleetlink_agent::ports::Drainable;
use fleetlink_devkit::test_utils::heartbeat_configuration;
use fleetlink_devkit::{MockRegistration, ScriptedReply, TestHarness};
use std::time::Duration;

#[tokio::test]
async fn test_delta_carries_only_changed_hostname() {
    let harness = TestHarness::new().with_configuration(60, Some(HardwareScope::Delta));
    let heartbeat = harness.heartbeat();

    heartbeat.push_information().await.unwrap();
    harness.hardware.set_hostname("edge-02");
    heartbeat.push_information().await.unwrap();
    heartbeat.push_information().await.unwrap();

    let reports = harness.dispatcher.heartbeats().unwrap();
    assert_eq!(reports.len(), 3);

    let first = reports[0].hardware.as_ref().unwrap();
    assert!(first.is_full());
    assert_eq!(first.hostname.as_deref(), Some("edge-01"));

    let second = reports[1].hardware.as_ref().unwrap();
    assert_eq!(
        *second,
        HardwareInfo {
            hostname: Some("edge-02".to_string()),
            ..HardwareInfo::default()
        }
    );

    // unchanged snapshot: every mutable field empty
    assert_eq!(reports[2].hardware, Some(HardwareInfo::default()));
}

#[tokio::test]
async fn test_full_scope_sends_whole_mutable_snapshot() {
    let harness = TestHarness::new().with_configuration(60, Some(HardwareScope::Full));
    let heartbeat = harness.heartbeat();

    heartbeat.push_information().await.unwrap();
    heartbeat.push_information().await.unwrap();

    let reports = harness.dispatcher.heartbeats().unwrap();
    let second = reports[1].hardware.as_ref().unwrap();
    assert!(!second.is_full());
    assert_eq!(second.hostname.as_deref(), Some("edge-01"));
    assert!(second.interfaces.is_some());
}

#[tokio::test]
async fn test_hardware_skipped_without_profile() {
    let harness = TestHarness::new();
    let heartbeat = harness.heartbeat();

    heartbeat.push_information().await.unwrap();

    let reports = harness.dispatcher.heartbeats().unwrap();
    assert!(reports[0].hardware.is_none());
    assert!(heartbeat.data().previous_hardware_info().is_none());
}

#[tokio::test]
async fn test_failed_first_heartbeat_resends_full_snapshot() {
    let harness = TestHarness::new().with_configuration(60, Some(HardwareScope::Delta));
    harness.dispatcher.script([ScriptedReply::Error("broker down".into())]);
    let heartbeat = harness.heartbeat();

    let err = heartbeat.push_information().await.unwrap_err();
    assert!(matches!(err, HeartbeatError::Transport(TransportError::Rpc(_))));
    assert!(heartbeat.is_first_heartbeat());
    assert!(heartbeat.data().previous_hardware_info().is_none());

    heartbeat.push_information().await.unwrap();
    assert!(!heartbeat.is_first_heartbeat());

    let reports = harness.dispatcher.heartbeats().unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports[1].hardware.as_ref().unwrap().is_full());
}

#[tokio::test]
async fn test_hardware_failure_on_first_tick_keeps_cache_empty() {
    let harness = TestHarness::new().with_configuration(60, Some(HardwareScope::Delta));
    harness.hardware.fail_mutable_snapshot(true);
    let heartbeat = harness.heartbeat();

    // the heartbeat still goes out, just without hardware
    heartbeat.push_information().await.unwrap();
    assert!(heartbeat.data().previous_hardware_info().is_none());

    harness.hardware.fail_mutable_snapshot(false);
    heartbeat.push_information().await.unwrap();

    let reports = harness.dispatcher.heartbeats().unwrap();
    assert!(reports[0].hardware.is_none());
    assert!(reports[1].hardware.as_ref().unwrap().is_full());
}

#[tokio::test]
async fn test_hardware_failure_leaves_previous_snapshot_untouched() {
    let harness = TestHarness::new().with_configuration(60, Some(HardwareScope::Delta));
    let heartbeat = harness.heartbeat();

    heartbeat.push_information().await.unwrap();
    let first = harness.dispatcher.heartbeats().unwrap()[0].hardware.clone().unwrap();
    let cached = heartbeat.data().previous_hardware_info();
    assert_eq!(cached, Some(first.mutable_part()));

    harness.hardware.fail_mutable_snapshot(true);
    heartbeat.push_information().await.unwrap();
    assert_eq!(heartbeat.data().previous_hardware_info(), cached);

    harness.dispatcher.clear();
    harness.hardware.fail_mutable_snapshot(false);
    let wifi = vec![Interface {
        name: "wlan0".to_string(),
        mac_address: "11:22:33:44:55:66".to_string(),
        ipv4_addresses: vec!["192.168.1.20".to_string()],
        ipv6_addresses: Vec::new(),
    }];
    harness.hardware.set_interfaces(wifi.clone());
    heartbeat.push_information().await.unwrap();

    // delta against the snapshot cached before the failure
    let reports = harness.dispatcher.heartbeats().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(
        reports[0].hardware,
        Some(HardwareInfo {
            interfaces: Some(wifi),
            ..HardwareInfo::default()
        })
    );
}

#[tokio::test]
async fn test_empty_response_means_unreachable() {
    let harness = TestHarness::new();
    harness.dispatcher.script([ScriptedReply::Empty]);
    let heartbeat = harness.heartbeat();

    let err = heartbeat.push_information().await.unwrap_err();
    assert!(matches!(err, HeartbeatError::Transport(TransportError::Unreachable)));
    assert_eq!(harness.registration.calls(), 0);
}

#[tokio::test]
async fn test_unauthorized_triggers_one_identical_retransmission() {
    let harness = TestHarness::new().with_configuration(60, Some(HardwareScope::Delta));
    harness
        .dispatcher
        .script([ScriptedReply::Status(401), ScriptedReply::Status(200)]);
    let heartbeat = harness.heartbeat();

    heartbeat.push_information().await.unwrap();

    assert_eq!(harness.registration.calls(), 1);
    let sent = harness.dispatcher.sent_messages();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], sent[1]);
}

#[tokio::test]
async fn test_unauthorized_twice_gives_up() {
    let harness = TestHarness::new();
    harness
        .dispatcher
        .script([ScriptedReply::Status(401), ScriptedReply::Status(401)]);
    let heartbeat = harness.heartbeat();

    let err = heartbeat.push_information().await.unwrap_err();
    assert!(matches!(err, HeartbeatError::AuthExpired(_)));
    assert_eq!(harness.dispatcher.sent_messages().len(), 2);
    assert_eq!(harness.registration.calls(), 1);
}

#[tokio::test]
async fn test_resend_happens_even_if_registration_fails() {
    let harness = TestHarness::new().with_registration(MockRegistration::failing());
    harness
        .dispatcher
        .script([ScriptedReply::Status(401), ScriptedReply::Empty]);
    let heartbeat = harness.heartbeat();

    let err = heartbeat.push_information().await.unwrap_err();
    assert!(matches!(err, HeartbeatError::AuthExpired(_)));
    assert_eq!(harness.dispatcher.sent_messages().len(), 2);
}

#[tokio::test]
async fn test_other_status_codes_do_not_reregister() {
    let harness = TestHarness::new();
    harness.dispatcher.script([ScriptedReply::Status(500)]);
    let heartbeat = harness.heartbeat();

    heartbeat.push_information().await.unwrap();
    assert_eq!(harness.registration.calls(), 0);
    assert_eq!(harness.dispatcher.sent_messages().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_send_timeout() {
    let mut harness = TestHarness::new();
    harness.send_timeout = Duration::from_millis(500);
    harness
        .dispatcher
        .script([ScriptedReply::Delayed(Duration::from_secs(5), 200)]);
    let heartbeat = harness.heartbeat();

    let err = heartbeat.push_information().await.unwrap_err();
    assert!(matches!(err, HeartbeatError::Transport(TransportError::Timeout(_))));
}

#[tokio::test(start_paused = true)]
async fn test_sends_never_overlap() {
    let harness = TestHarness::new();
    harness.dispatcher.script([
        ScriptedReply::Delayed(Duration::from_millis(200), 200),
        ScriptedReply::Delayed(Duration::from_millis(200), 200),
    ]);
    let heartbeat = harness.heartbeat();

    let (a, b) = tokio::join!(heartbeat.push_information(), heartbeat.push_information());
    a.unwrap();
    b.unwrap();
    assert_eq!(harness.dispatcher.max_concurrent_sends(), 1);
}

#[tokio::test]
async fn test_report_collects_collaborator_state() {
    let harness = TestHarness::new();
    let synced_at = Utc::now();
    harness.workloads.add_workload("camera", "Running");
    harness.workloads.push_event(EventInfo::warn("Restarted", "camera restarted"));
    harness.data_monitor.set_sync_time("camera", synced_at);
    harness.dispatch.add_execution("setup", "Succeeded");
    let heartbeat = harness.heartbeat();

    heartbeat.push_information().await.unwrap();
    heartbeat.push_information().await.unwrap();

    let reports = harness.dispatcher.heartbeats().unwrap();
    let first = &reports[0];
    assert_eq!(first.version, 1);
    assert_eq!(first.workloads[0].name, "camera");
    assert_eq!(first.workloads[0].last_data_upload, Some(synced_at));
    assert_eq!(first.executions[0].status, "Succeeded");
    assert_eq!(first.events.len(), 1);
    // events are handed out once
    assert!(reports[1].events.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_timer_follows_configuration() {
    let harness = TestHarness::new().with_configuration(10, None);
    let heartbeat = harness.heartbeat();

    heartbeat.start();
    assert!(heartbeat.has_started());
    assert_eq!(heartbeat.current_period(), Some(Duration::from_secs(10)));

    tokio::time::sleep(Duration::from_secs(35)).await;
    assert_eq!(harness.dispatcher.heartbeats().unwrap().len(), 3);

    harness.config.update(heartbeat_configuration(2, 5, None)).unwrap();
    assert_eq!(heartbeat.current_period(), Some(Duration::from_secs(5)));

    tokio::time::sleep(Duration::from_secs(12)).await;
    let reports = harness.dispatcher.heartbeats().unwrap();
    assert_eq!(reports.len(), 5);
    assert_eq!(reports[4].version, 2);

    heartbeat.deregister().await.unwrap();
    assert!(!heartbeat.has_started());
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(harness.dispatcher.heartbeats().unwrap().len(), 5);

    // idempotent
    heartbeat.deregister().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_non_positive_period_uses_default() {
    let harness = TestHarness::new().with_configuration(0, None);
    let heartbeat = harness.heartbeat();

    heartbeat.start();
    assert_eq!(heartbeat.current_period(), Some(Duration::from_secs(60)));

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert!(harness.dispatcher.heartbeats().unwrap().is_empty());
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(harness.dispatcher.heartbeats().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_update_with_same_period_keeps_timer() {
    let harness = TestHarness::new().with_configuration(10, None);
    let heartbeat = harness.heartbeat();
    heartbeat.start();

    tokio::time::sleep(Duration::from_secs(7)).await;
    // same period: the running timer keeps its phase
    harness.config.update(heartbeat_configuration(2, 10, None)).unwrap();
    tokio::time::sleep(Duration::from_secs(4)).await;

    assert_eq!(harness.dispatcher.heartbeats().unwrap().len(), 1);
}
