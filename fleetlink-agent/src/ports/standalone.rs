//! Stand-ins for devices without a container runtime or metrics pipeline

use super::{DataMonitor, Drainable, MetricsStore, WorkloadInfo, WorkloadManager};
use crate::models::EventInfo;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

/// Workload manager for a device that runs no workloads
pub struct NoWorkloads {
    device_id: String,
}

impl NoWorkloads {
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
        }
    }
}

#[async_trait]
impl WorkloadManager for NoWorkloads {
    async fn list_workloads(&self) -> Result<Vec<WorkloadInfo>> {
        Ok(Vec::new())
    }

    async fn stop_workloads(&self) -> Result<()> {
        debug!("no workloads to stop. DeviceID: {}", self.device_id);
        Ok(())
    }

    fn pop_events(&self) -> Vec<EventInfo> {
        Vec::new()
    }

    fn device_id(&self) -> String {
        self.device_id.clone()
    }
}

/// Data monitor that never uploads anything
pub struct NoDataMonitor;

#[async_trait]
impl Drainable for NoDataMonitor {
    async fn deregister(&self) -> Result<()> {
        Ok(())
    }
}

impl DataMonitor for NoDataMonitor {
    fn last_successful_sync_time(&self, _name: &str) -> Option<DateTime<Utc>> {
        None
    }
}

/// Metrics store that keeps nothing
pub struct NoMetricsStore;

#[async_trait]
impl Drainable for NoMetricsStore {
    async fn deregister(&self) -> Result<()> {
        Ok(())
    }
}

impl MetricsStore for NoMetricsStore {}
