//! Collaborator ports
//!
//! Contracts the agent core consumes without owning the implementation:
//! - `WorkloadManager`: workload listing, stop, events
//! - `DispatchManager`: ledger-backed execution dispatch
//! - `DataMonitor`, `SystemMetricsCollector`, `MetricsStore`: drain targets
//! - `OsController`: upgrade snapshot
//! - `Registration`: credential (re)registration with the dispatcher
//!
//! Every subsystem that must be drained before a reboot implements `Drainable`.

pub mod standalone;

use crate::models::{EventInfo, UpgradeStatus};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Workload as listed by the workload manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadInfo {
    pub name: String,
    pub status: String,
}

/// Execution as listed by the dispatch manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub name: String,
    pub status: String,
}

/// Subsystem that can be stopped ahead of a lifecycle transition
#[async_trait]
pub trait Drainable: Send + Sync {
    async fn deregister(&self) -> Result<()>;
}

#[async_trait]
pub trait WorkloadManager: Send + Sync {
    async fn list_workloads(&self) -> Result<Vec<WorkloadInfo>>;

    async fn stop_workloads(&self) -> Result<()>;

    /// Drain queued events; each event is returned once
    fn pop_events(&self) -> Vec<EventInfo>;

    fn device_id(&self) -> String;
}

#[async_trait]
pub trait DispatchManager: Send + Sync {
    fn list(&self) -> Vec<ExecutionInfo>;

    fn pop_events(&self) -> Vec<EventInfo>;

    /// Block until no dispatched execution is in flight. No timeout.
    async fn wait_for_completion(&self);
}

/// Data-transfer monitor
pub trait DataMonitor: Drainable {
    /// Last time data produced by `name` was uploaded successfully
    fn last_successful_sync_time(&self, name: &str) -> Option<DateTime<Utc>>;
}

pub trait SystemMetricsCollector: Drainable {}

pub trait MetricsStore: Drainable {}

pub trait OsController: Send + Sync {
    fn upgrade_status(&self) -> UpgradeStatus;
}

#[async_trait]
pub trait Registration: Send + Sync {
    /// Renew the device's credentials with the dispatcher
    async fn register_device(&self) -> Result<()>;
}
