//! OS layer
//!
//! Reports the last OS upgrade and performs graceful reboots: the lifecycle
//! orchestrator drains the agent first, then the platform reboot command runs.

use crate::lifecycle::RebootHandle;
use crate::models::UpgradeStatus;
use crate::ports::OsController;
use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info, warn};

/// Written by the upgrade tooling, read on every heartbeat
pub const UPGRADE_STATUS_FILE: &str = "upgrade-status.json";

pub struct DeviceOs {
    upgrade_status_path: PathBuf,
    reboot: RebootHandle,
    reboot_command: Vec<String>,
}

impl DeviceOs {
    pub fn new(data_dir: impl Into<PathBuf>, reboot: RebootHandle) -> Self {
        Self {
            upgrade_status_path: data_dir.into().join(UPGRADE_STATUS_FILE),
            reboot,
            reboot_command: Self::platform_reboot_command(),
        }
    }

    pub fn with_reboot_command(mut self, command: Vec<String>) -> Self {
        self.reboot_command = command;
        self
    }

    fn platform_reboot_command() -> Vec<String> {
        let args: &[&str] = if cfg!(target_os = "windows") {
            &["shutdown", "/r", "/t", "0"]
        } else {
            &["systemctl", "reboot"]
        };
        args.iter().map(|s| s.to_string()).collect()
    }

    /// Drain the agent, wait for the acknowledgement, then reboot
    pub async fn graceful_reboot(&self) -> Result<()> {
        info!("graceful reboot requested");
        self.reboot.request_graceful_reboot().await?;

        let (program, args) = self
            .reboot_command
            .split_first()
            .ok_or_else(|| anyhow!("no reboot command configured"))?;
        info!("agent drained, running {:?}", self.reboot_command);

        let output = AsyncCommand::new(program)
            .args(args)
            .output()
            .await
            .context("Failed to execute reboot command")?;

        if output.status.success() {
            Ok(())
        } else {
            Err(anyhow!("Reboot failed: {}", String::from_utf8_lossy(&output.stderr)))
        }
    }
}

impl OsController for DeviceOs {
    fn upgrade_status(&self) -> UpgradeStatus {
        let content = match std::fs::read(&self.upgrade_status_path) {
            Ok(content) => content,
            Err(e) => {
                debug!("no upgrade status at {}: {}", self.upgrade_status_path.display(), e);
                return UpgradeStatus::default();
            }
        };
        serde_json::from_slice(&content).unwrap_or_else(|e| {
            warn!("unreadable upgrade status {}: {}", self.upgrade_status_path.display(), e);
            UpgradeStatus::default()
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::lifecycle::{reboot_channel, DrainTargets, LifecycleOrchestrator, LifecycleState};
    use crate::ports::standalone::{NoDataMonitor, NoMetricsStore, NoWorkloads};
    use crate::ports::{Drainable, SystemMetricsCollector};
    use async_trait::async_trait;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Idle;

    #[async_trait]
    impl Drainable for Idle {
        async fn deregister(&self) -> Result<()> {
            Ok(())
        }
    }

    impl SystemMetricsCollector for Idle {}

    fn orchestrator() -> (LifecycleOrchestrator, RebootHandle) {
        let (handle, requests) = reboot_channel();
        let orchestrator = LifecycleOrchestrator::new(
            DrainTargets {
                workloads: Arc::new(NoWorkloads::new("dev-1")),
                data_monitor: Arc::new(NoDataMonitor),
                system_metrics: Arc::new(Idle),
                metrics_store: Arc::new(NoMetricsStore),
                heartbeat: Arc::new(Idle),
                dispatch: None,
            },
            requests,
        );
        (orchestrator, handle)
    }

    #[test]
    fn test_upgrade_status_defaults_when_missing() {
        let dir = TempDir::new().unwrap();
        let (_orchestrator, handle) = orchestrator();
        let os = DeviceOs::new(dir.path(), handle);
        assert_eq!(os.upgrade_status(), UpgradeStatus::default());
    }

    #[test]
    fn test_upgrade_status_is_read_from_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(UPGRADE_STATUS_FILE),
            r#"{"current_commit_id": "abc123", "last_upgrade_status": "success"}"#,
        )
        .unwrap();
        let (_orchestrator, handle) = orchestrator();
        let os = DeviceOs::new(dir.path(), handle);

        let status = os.upgrade_status();
        assert_eq!(status.current_commit_id.as_deref(), Some("abc123"));
        assert_eq!(status.last_upgrade_status.as_deref(), Some("success"));
    }

    #[tokio::test]
    async fn test_graceful_reboot_waits_for_drain() {
        let dir = TempDir::new().unwrap();
        let (orchestrator, handle) = orchestrator();
        let mut state = orchestrator.state();
        let listener = tokio::spawn(orchestrator.run());

        let os = DeviceOs::new(dir.path(), handle).with_reboot_command(vec!["true".into()]);
        os.graceful_reboot().await.unwrap();
        assert_eq!(*state.borrow_and_update(), LifecycleState::Completed);

        drop(os);
        listener.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failing_reboot_command_is_reported() {
        let dir = TempDir::new().unwrap();
        let (orchestrator, handle) = orchestrator();
        tokio::spawn(orchestrator.run());

        let os = DeviceOs::new(dir.path(), handle).with_reboot_command(vec!["false".into()]);
        assert!(os.graceful_reboot().await.is_err());
    }
}
