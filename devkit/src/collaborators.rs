/*!
Recording collaborators

Test doubles for the agent's collaborator ports. Drain targets share a
`CallLog` so tests can assert on the order subsystems were stopped in, and any
of them can be told to fail.
*/

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetlink_agent::hardware::HardwareProbe;
use fleetlink_agent::models::{Cpu, EventInfo, HardwareInfo, Interface, UpgradeStatus};
use fleetlink_agent::ports::{
    DataMonitor, DispatchManager, Drainable, ExecutionInfo, MetricsStore, OsController,
    SystemMetricsCollector, WorkloadInfo, WorkloadManager,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared, ordered record of collaborator calls
#[derive(Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, call: &str) {
        log::debug!("[MOCK] {}", call);
        self.calls.lock().push(call.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

/// Drain target recording `deregister` calls
pub struct RecordingDrain {
    name: String,
    log: CallLog,
    fail: AtomicBool,
    sync_times: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl RecordingDrain {
    pub fn new(name: &str, log: &CallLog) -> Self {
        Self {
            name: name.to_string(),
            log: log.clone(),
            fail: AtomicBool::new(false),
            sync_times: Mutex::new(HashMap::new()),
        }
    }

    pub fn fail_on_deregister(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn set_sync_time(&self, name: &str, at: DateTime<Utc>) {
        self.sync_times.lock().insert(name.to_string(), at);
    }
}

#[async_trait]
impl Drainable for RecordingDrain {
    async fn deregister(&self) -> Result<()> {
        self.log.record(&self.name);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("{} refused to deregister", self.name);
        }
        Ok(())
    }
}

impl DataMonitor for RecordingDrain {
    fn last_successful_sync_time(&self, name: &str) -> Option<DateTime<Utc>> {
        self.sync_times.lock().get(name).copied()
    }
}

impl SystemMetricsCollector for RecordingDrain {}

impl MetricsStore for RecordingDrain {}

/// Workload manager with a fixed workload list and an event queue
pub struct RecordingWorkloads {
    device_id: String,
    log: CallLog,
    workloads: Mutex<Vec<WorkloadInfo>>,
    events: Mutex<Vec<EventInfo>>,
    fail_stop: AtomicBool,
}

impl RecordingWorkloads {
    pub fn new(device_id: &str, log: &CallLog) -> Self {
        Self {
            device_id: device_id.to_string(),
            log: log.clone(),
            workloads: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            fail_stop: AtomicBool::new(false),
        }
    }

    pub fn add_workload(&self, name: &str, status: &str) {
        self.workloads.lock().push(WorkloadInfo {
            name: name.to_string(),
            status: status.to_string(),
        });
    }

    pub fn push_event(&self, event: EventInfo) {
        self.events.lock().push(event);
    }

    pub fn fail_on_stop(&self) {
        self.fail_stop.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkloadManager for RecordingWorkloads {
    async fn list_workloads(&self) -> Result<Vec<WorkloadInfo>> {
        Ok(self.workloads.lock().clone())
    }

    async fn stop_workloads(&self) -> Result<()> {
        self.log.record("workloads");
        if self.fail_stop.load(Ordering::SeqCst) {
            anyhow::bail!("workloads refused to stop");
        }
        Ok(())
    }

    fn pop_events(&self) -> Vec<EventInfo> {
        std::mem::take(&mut *self.events.lock())
    }

    fn device_id(&self) -> String {
        self.device_id.clone()
    }
}

/// Dispatch manager with a fixed execution list
pub struct RecordingDispatch {
    log: CallLog,
    executions: Mutex<Vec<ExecutionInfo>>,
}

impl RecordingDispatch {
    pub fn new(log: &CallLog) -> Self {
        Self {
            log: log.clone(),
            executions: Mutex::new(Vec::new()),
        }
    }

    pub fn add_execution(&self, name: &str, status: &str) {
        self.executions.lock().push(ExecutionInfo {
            name: name.to_string(),
            status: status.to_string(),
        });
    }
}

#[async_trait]
impl DispatchManager for RecordingDispatch {
    fn list(&self) -> Vec<ExecutionInfo> {
        self.executions.lock().clone()
    }

    fn pop_events(&self) -> Vec<EventInfo> {
        Vec::new()
    }

    async fn wait_for_completion(&self) {
        self.log.record("executions");
    }
}

/// Hardware probe serving a settable snapshot
pub struct StaticHardwareProbe {
    hostname: Mutex<String>,
    interfaces: Mutex<Vec<Interface>>,
    fail_mutable: AtomicBool,
}

impl StaticHardwareProbe {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: Mutex::new(hostname.to_string()),
            interfaces: Mutex::new(vec![Interface {
                name: "eth0".to_string(),
                mac_address: "aa:bb:cc:dd:ee:ff".to_string(),
                ipv4_addresses: vec!["10.0.0.2".to_string()],
                ipv6_addresses: Vec::new(),
            }]),
            fail_mutable: AtomicBool::new(false),
        }
    }

    pub fn set_hostname(&self, hostname: &str) {
        *self.hostname.lock() = hostname.to_string();
    }

    pub fn set_interfaces(&self, interfaces: Vec<Interface>) {
        *self.interfaces.lock() = interfaces;
    }

    pub fn fail_mutable_snapshot(&self, fail: bool) {
        self.fail_mutable.store(fail, Ordering::SeqCst);
    }
}

impl HardwareProbe for StaticHardwareProbe {
    fn full_snapshot(&self) -> Result<HardwareInfo> {
        let mutable = self.mutable_snapshot()?;
        Ok(HardwareInfo {
            cpu: Some(Cpu {
                architecture: "x86_64".to_string(),
                model_name: "Mock CPU".to_string(),
                core_count: 4,
            }),
            ..mutable
        })
    }

    fn mutable_snapshot(&self) -> Result<HardwareInfo> {
        if self.fail_mutable.load(Ordering::SeqCst) {
            anyhow::bail!("probe unavailable");
        }
        Ok(HardwareInfo {
            hostname: Some(self.hostname.lock().clone()),
            interfaces: Some(self.interfaces.lock().clone()),
            ..HardwareInfo::default()
        })
    }
}

/// OS controller reporting a fixed upgrade status
#[derive(Default)]
pub struct StaticOs {
    pub status: UpgradeStatus,
}

impl OsController for StaticOs {
    fn upgrade_status(&self) -> UpgradeStatus {
        self.status.clone()
    }
}
