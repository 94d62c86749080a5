/*!
Test harness for the FleetLink agent

Wires a `HeartbeatService` and a `LifecycleOrchestrator` to recording
collaborators and a mock dispatcher, so integration tests only have to script
the scenario and assert on what happened.
*/

use crate::collaborators::{CallLog, RecordingDispatch, RecordingDrain, RecordingWorkloads, StaticHardwareProbe, StaticOs};
use crate::dispatcher_stub::{MockDispatcher, MockRegistration};
use fleetlink_agent::config::{
    ConfigurationManager, DeviceConfiguration, DeviceConfigurationMessage, HardwareProfile, HardwareScope,
    HeartbeatConfiguration,
};
use fleetlink_agent::heartbeat::{HeartbeatService, HeartbeatSources};
use fleetlink_agent::ledger::ExecutionLedger;
use fleetlink_agent::lifecycle::{reboot_channel, DrainTargets, LifecycleOrchestrator, RebootHandle};
use fleetlink_agent::ports::Drainable;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const TEST_DEVICE_ID: &str = "device-under-test";

/// Harness holding every collaborator of the agent core
pub struct TestHarness {
    pub log: CallLog,
    pub config: Arc<ConfigurationManager>,
    pub dispatcher: MockDispatcher,
    pub registration: MockRegistration,
    pub workloads: Arc<RecordingWorkloads>,
    pub dispatch: Arc<RecordingDispatch>,
    pub data_monitor: Arc<RecordingDrain>,
    pub system_metrics: Arc<RecordingDrain>,
    pub metrics_store: Arc<RecordingDrain>,
    pub hardware: Arc<StaticHardwareProbe>,
    pub os: Arc<StaticOs>,
    pub send_timeout: Duration,
}

/// Device configuration with the given heartbeat period and hardware profile
pub fn heartbeat_configuration(
    version: u64,
    period_seconds: i64,
    hardware: Option<HardwareScope>,
) -> DeviceConfigurationMessage {
    DeviceConfigurationMessage {
        device_id: TEST_DEVICE_ID.to_string(),
        version,
        configuration: DeviceConfiguration {
            heartbeat: Some(HeartbeatConfiguration {
                period_seconds,
                hardware_profile: HardwareProfile {
                    include: hardware.is_some(),
                    scope: hardware.unwrap_or_default(),
                },
            }),
        },
    }
}

impl TestHarness {
    pub fn new() -> Self {
        env_logger::try_init().ok();

        let log = CallLog::new();
        Self {
            config: Arc::new(ConfigurationManager::with_initial(heartbeat_configuration(1, 60, None))),
            dispatcher: MockDispatcher::new(),
            registration: MockRegistration::new(),
            workloads: Arc::new(RecordingWorkloads::new(TEST_DEVICE_ID, &log)),
            dispatch: Arc::new(RecordingDispatch::new(&log)),
            data_monitor: Arc::new(RecordingDrain::new("data-monitor", &log)),
            system_metrics: Arc::new(RecordingDrain::new("system-metrics", &log)),
            metrics_store: Arc::new(RecordingDrain::new("metrics-store", &log)),
            hardware: Arc::new(StaticHardwareProbe::new("edge-01")),
            os: Arc::new(StaticOs::default()),
            send_timeout: Duration::from_secs(1),
            log,
        }
    }

    /// Start from a configuration with the given period and hardware scope
    pub fn with_configuration(mut self, period_seconds: i64, hardware: Option<HardwareScope>) -> Self {
        self.config = Arc::new(ConfigurationManager::with_initial(heartbeat_configuration(
            1,
            period_seconds,
            hardware,
        )));
        self
    }

    pub fn with_registration(mut self, registration: MockRegistration) -> Self {
        self.registration = registration;
        self
    }

    /// Heartbeat service wired to the harness collaborators and registered
    /// as configuration observer
    pub fn heartbeat(&self) -> HeartbeatService {
        let heartbeat = HeartbeatService::new(
            HeartbeatSources {
                config: Arc::clone(&self.config),
                workloads: self.workloads.clone(),
                dispatch: Some(self.dispatch.clone()),
                data_monitor: self.data_monitor.clone(),
                hardware: self.hardware.clone(),
                os: self.os.clone(),
            },
            Arc::new(self.dispatcher.clone()),
            Arc::new(self.registration.clone()),
            self.send_timeout,
        );
        self.config.register_observer(Arc::new(heartbeat.clone()));
        heartbeat
    }

    /// Orchestrator draining the harness collaborators; the heartbeat step
    /// is recorded as "heartbeat" in the call log
    pub fn orchestrator(&self) -> (LifecycleOrchestrator, RebootHandle) {
        let (handle, requests) = reboot_channel();
        let orchestrator = LifecycleOrchestrator::new(
            DrainTargets {
                workloads: self.workloads.clone(),
                data_monitor: self.data_monitor.clone(),
                system_metrics: self.system_metrics.clone(),
                metrics_store: self.metrics_store.clone(),
                heartbeat: Arc::new(RecordingDrain::new("heartbeat", &self.log)) as Arc<dyn Drainable>,
                dispatch: Some(self.dispatch.clone()),
            },
            requests,
        );
        (orchestrator, handle)
    }
}

/// Ledger in a fresh temporary directory; keep the `TempDir` alive
pub fn temp_ledger() -> anyhow::Result<(TempDir, Arc<ExecutionLedger>)> {
    let dir = TempDir::new()?;
    let ledger = Arc::new(ExecutionLedger::open(dir.path())?);
    Ok((dir, ledger))
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
