//! Hardware probing for heartbeat reports
//!
//! This module handles:
//! - Immutable hardware (CPU, system vendor, host devices), collected once
//! - Mutable hardware (hostname, network interfaces), collected every heartbeat
//! - Delta computation between two mutable snapshots

use crate::models::{Cpu, HardwareInfo, HostDevice, Interface, SystemVendor};
use anyhow::{Context, Result};
use if_addrs::{get_if_addrs, IfAddr};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use sysinfo::System;
use tracing::{debug, warn};

/// Source of hardware snapshots
pub trait HardwareProbe: Send + Sync {
    /// Immutable + mutable hardware
    fn full_snapshot(&self) -> Result<HardwareInfo>;

    /// Mutable hardware only (hostname, interfaces)
    fn mutable_snapshot(&self) -> Result<HardwareInfo>;
}

/// Fields of `current` that differ from `previous`; unchanged fields are `None`
pub fn mutable_delta(previous: &HardwareInfo, current: &HardwareInfo) -> HardwareInfo {
    let mut delta = HardwareInfo::default();
    if previous.hostname != current.hostname {
        delta.hostname = current.hostname.clone();
    }
    if previous.interfaces != current.interfaces {
        delta.interfaces = current.interfaces.clone();
    }
    delta
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum InterfaceKind {
    Ethernet,
    Wireless,
    Other,
}

fn classify_interface(name: &str) -> InterfaceKind {
    let name = name.to_lowercase();
    if ["wlan", "wifi", "wlp", "wlo"].iter().any(|p| name.contains(p)) {
        InterfaceKind::Wireless
    } else if name.starts_with("eth") || name.starts_with("en") {
        InterfaceKind::Ethernet
    } else {
        InterfaceKind::Other
    }
}

/// Device id derived from the primary MAC (ethernet, then wireless, then
/// anything else), colons stripped
pub fn primary_device_id(interfaces: &[Interface]) -> Option<String> {
    interfaces
        .iter()
        .filter(|i| !i.mac_address.is_empty())
        .min_by_key(|i| classify_interface(&i.name))
        .map(|i| i.mac_address.replace(':', ""))
}

/// Probe reading the local host
#[derive(Default)]
pub struct HostHardwareProbe {
    immutable: OnceLock<HardwareInfo>,
}

impl HostHardwareProbe {
    pub fn new() -> Self {
        Self::default()
    }

    fn immutable(&self) -> &HardwareInfo {
        self.immutable.get_or_init(|| {
            debug!("Collecting immutable hardware information...");
            HardwareInfo {
                cpu: Some(Self::cpu()),
                system_vendor: Some(Self::system_vendor()),
                host_devices: Self::host_devices().unwrap_or_else(|e| {
                    warn!("failed to list host devices: {:#}", e);
                    Vec::new()
                }),
                ..HardwareInfo::default()
            }
        })
    }

    fn cpu() -> Cpu {
        let mut sys = System::new();
        sys.refresh_cpu();
        let cpus = sys.cpus();
        Cpu {
            architecture: std::env::consts::ARCH.to_string(),
            model_name: cpus.first().map(|c| c.brand().trim().to_string()).unwrap_or_default(),
            core_count: cpus.len(),
        }
    }

    fn system_vendor() -> SystemVendor {
        let read = |file: &str| {
            std::fs::read_to_string(format!("/sys/class/dmi/id/{}", file))
                .map(|s| s.trim().to_string())
                .unwrap_or_default()
        };
        let manufacturer = read("sys_vendor");
        let product_name = read("product_name");
        let is_virtual = ["KVM", "QEMU", "VirtualBox", "VMware", "Virtual Machine"]
            .iter()
            .any(|marker| product_name.contains(marker) || manufacturer.contains(marker));
        SystemVendor {
            manufacturer,
            product_name,
            serial_number: read("product_serial"),
            is_virtual,
        }
    }

    #[cfg(unix)]
    fn host_devices() -> Result<Vec<HostDevice>> {
        use std::os::unix::fs::{FileTypeExt, MetadataExt};

        let mut devices = Vec::new();
        for entry in std::fs::read_dir("/dev").context("Failed to read /dev")? {
            let entry = entry?;
            let Ok(meta) = entry.metadata() else { continue };
            let file_type = meta.file_type();
            let device_type = if file_type.is_block_device() {
                "b"
            } else if file_type.is_char_device() {
                "c"
            } else {
                continue;
            };
            let rdev = meta.rdev();
            devices.push(HostDevice {
                path: entry.path().to_string_lossy().to_string(),
                device_type: device_type.to_string(),
                major: ((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff),
                minor: (rdev & 0xff) | ((rdev >> 12) & !0xff),
                uid: meta.uid(),
                gid: meta.gid(),
            });
        }
        devices.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(devices)
    }

    #[cfg(not(unix))]
    fn host_devices() -> Result<Vec<HostDevice>> {
        Ok(Vec::new())
    }

    /// Non-loopback interfaces with at least one address, sorted by name
    fn interfaces() -> Result<Vec<Interface>> {
        let if_addrs = get_if_addrs().context("Failed to enumerate network interfaces")?;

        let mut by_name: BTreeMap<String, Interface> = BTreeMap::new();
        for if_addr in if_addrs {
            if if_addr.is_loopback() {
                continue;
            }
            let interface = by_name.entry(if_addr.name.clone()).or_insert_with(|| Interface {
                name: if_addr.name.clone(),
                mac_address: Self::interface_mac(&if_addr.name).unwrap_or_default(),
                ipv4_addresses: Vec::new(),
                ipv6_addresses: Vec::new(),
            });
            match if_addr.addr {
                IfAddr::V4(v4) => interface.ipv4_addresses.push(v4.ip.to_string()),
                IfAddr::V6(v6) => interface.ipv6_addresses.push(v6.ip.to_string()),
            }
        }

        let mut interfaces: Vec<Interface> = by_name.into_values().collect();
        for interface in &mut interfaces {
            interface.ipv4_addresses.sort();
            interface.ipv6_addresses.sort();
        }
        Ok(interfaces)
    }

    fn interface_mac(interface_name: &str) -> Option<String> {
        match mac_address::mac_address_by_name(interface_name) {
            Ok(Some(mac)) => Some(mac.to_string().to_lowercase()),
            Ok(None) => None,
            Err(e) => {
                debug!("Error getting MAC for {}: {}", interface_name, e);
                None
            }
        }
    }
}

impl HardwareProbe for HostHardwareProbe {
    fn full_snapshot(&self) -> Result<HardwareInfo> {
        let mutable = self.mutable_snapshot()?;
        Ok(HardwareInfo {
            hostname: mutable.hostname,
            interfaces: mutable.interfaces,
            ..self.immutable().clone()
        })
    }

    fn mutable_snapshot(&self) -> Result<HardwareInfo> {
        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        Ok(HardwareInfo {
            hostname: Some(hostname),
            interfaces: Some(Self::interfaces()?),
            ..HardwareInfo::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, ip: &str) -> Interface {
        Interface {
            name: name.to_string(),
            mac_address: "aa:bb:cc:dd:ee:ff".to_string(),
            ipv4_addresses: vec![ip.to_string()],
            ipv6_addresses: vec![],
        }
    }

    fn snapshot(hostname: &str, ip: &str) -> HardwareInfo {
        HardwareInfo {
            hostname: Some(hostname.to_string()),
            interfaces: Some(vec![iface("eth0", ip)]),
            ..HardwareInfo::default()
        }
    }

    #[test]
    fn test_delta_hostname_only() {
        let delta = mutable_delta(&snapshot("edge-01", "10.0.0.2"), &snapshot("edge-02", "10.0.0.2"));
        assert_eq!(delta.hostname.as_deref(), Some("edge-02"));
        assert!(delta.interfaces.is_none());
        assert!(!delta.is_full());
    }

    #[test]
    fn test_delta_unchanged_is_empty() {
        let snap = snapshot("edge-01", "10.0.0.2");
        assert_eq!(mutable_delta(&snap, &snap), HardwareInfo::default());
    }

    #[test]
    fn test_delta_interfaces_changed() {
        let delta = mutable_delta(&snapshot("edge-01", "10.0.0.2"), &snapshot("edge-01", "10.0.0.3"));
        assert!(delta.hostname.is_none());
        assert_eq!(delta.interfaces.unwrap()[0].ipv4_addresses, vec!["10.0.0.3"]);
    }

    #[test]
    fn test_primary_device_id_prefers_ethernet() {
        let mut wifi = iface("wlan0", "10.0.0.9");
        wifi.mac_address = "11:22:33:44:55:66".into();
        let interfaces = vec![wifi, iface("eth0", "10.0.0.2")];
        assert_eq!(primary_device_id(&interfaces).as_deref(), Some("aabbccddeeff"));
        assert_eq!(primary_device_id(&interfaces[..1]).as_deref(), Some("112233445566"));
        assert_eq!(primary_device_id(&[]), None);
    }

    #[test]
    fn test_host_probe_reports_hostname() {
        let probe = HostHardwareProbe::new();
        let mutable = probe.mutable_snapshot().unwrap();
        assert!(mutable.hostname.is_some());
        assert!(!mutable.is_full());

        let full = probe.full_snapshot().unwrap();
        assert!(full.cpu.is_some());
        assert!(full.is_full());
    }
}
