//! Heartbeat wire model shared with the fleet controller
//!
//! Everything in here is a point-in-time snapshot: a report is assembled,
//! serialized once, and never mutated afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Device liveness as seen by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatStatus {
    Up,
}

/// Complete heartbeat payload (matches devices.heartbeat@v1)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub status: HeartbeatStatus,
    /// Version of the device configuration the agent is currently running
    pub version: u64,
    pub workloads: Vec<WorkloadStatus>,
    pub executions: Vec<ExecutionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware: Option<HardwareInfo>,
    pub events: Vec<EventInfo>,
    pub upgrade: UpgradeStatus,
}

/// Per-workload status line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_data_upload: Option<DateTime<Utc>>,
}

/// Per-execution status line (one per ledger record)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_data_upload: Option<DateTime<Utc>>,
}

/// Hardware snapshot, either full or a delta of the mutable subset.
///
/// `cpu`, `system_vendor` and `host_devices` are the immutable subset and are
/// only ever present in a full snapshot. `hostname` and `interfaces` are the
/// mutable subset; in a delta they are `None` when unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Cpu>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_vendor: Option<SystemVendor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_devices: Vec<HostDevice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<Interface>>,
}

impl HardwareInfo {
    /// True when the snapshot carries immutable fields, i.e. it is a full snapshot
    pub fn is_full(&self) -> bool {
        self.cpu.is_some() || self.system_vendor.is_some() || !self.host_devices.is_empty()
    }

    /// Keep only the mutable subset (what gets cached between heartbeats)
    pub fn mutable_part(&self) -> HardwareInfo {
        HardwareInfo {
            hostname: self.hostname.clone(),
            interfaces: self.interfaces.clone(),
            ..HardwareInfo::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cpu {
    pub architecture: String,
    pub model_name: String,
    pub core_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemVendor {
    pub manufacturer: String,
    pub product_name: String,
    pub serial_number: String,
    #[serde(rename = "virtual")]
    pub is_virtual: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDevice {
    pub path: String,
    pub device_type: String,
    pub major: u64,
    pub minor: u64,
    pub uid: u32,
    pub gid: u32,
}

/// Network interface, mutable hardware subset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub mac_address: String,
    pub ipv4_addresses: Vec<String>,
    pub ipv6_addresses: Vec<String>,
}

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Info,
    Warn,
}

/// Event drained from a manager and reported once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInfo {
    pub message: String,
    pub reason: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
}

impl EventInfo {
    pub fn info(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            reason: reason.into(),
            event_type: EventType::Info,
        }
    }

    pub fn warn(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            reason: reason.into(),
            event_type: EventType::Warn,
        }
    }
}

/// OS upgrade snapshot reported by the OS layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_commit_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_upgrade_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_upgrade_time: Option<DateTime<Utc>>,
}
