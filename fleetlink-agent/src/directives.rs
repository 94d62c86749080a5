//! Inbound directive routing
//!
//! Controller directives arrive as `DataMessage`s:
//! - `configuration`: a `DeviceConfigurationMessage` for the `ConfigurationManager`
//! - `execution`: an `ExecutionRequest` for the `ExecutionManager`
//! - `reboot`: a graceful reboot through the OS layer

use crate::config::{ConfigurationManager, DeviceConfigurationMessage};
use crate::dispatcher::DataMessage;
use crate::execution::{ExecutionManager, ExecutionRequest, EXECUTION_DIRECTIVE};
use crate::os::DeviceOs;
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

pub const CONFIGURATION_DIRECTIVE: &str = "configuration";
pub const REBOOT_DIRECTIVE: &str = "reboot";

pub struct DirectiveRouter {
    config: Arc<ConfigurationManager>,
    executions: ExecutionManager,
    os: Arc<DeviceOs>,
}

impl DirectiveRouter {
    pub fn new(config: Arc<ConfigurationManager>, executions: ExecutionManager, os: Arc<DeviceOs>) -> Self {
        Self { config, executions, os }
    }

    /// Apply directives until the transport goes away
    pub async fn run(self, mut inbound: mpsc::Receiver<DataMessage>) {
        while let Some(message) = inbound.recv().await {
            if let Err(e) = self.handle(message) {
                error!("cannot apply directive: {:#}", e);
            }
        }
        debug!("directive stream closed");
    }

    pub fn handle(&self, message: DataMessage) -> Result<()> {
        debug!("directive {} ({})", message.directive, message.message_id);
        match message.directive.as_str() {
            CONFIGURATION_DIRECTIVE => {
                let configuration: DeviceConfigurationMessage =
                    serde_json::from_value(message.content).context("invalid configuration directive")?;
                self.config.update(configuration)
            }
            EXECUTION_DIRECTIVE => {
                let request: ExecutionRequest =
                    serde_json::from_value(message.content).context("invalid execution directive")?;
                self.executions.handle_request(request)
            }
            REBOOT_DIRECTIVE => {
                info!("reboot directive received");
                let os = Arc::clone(&self.os);
                // the drain waits on executions; never block the directive loop on it
                tokio::spawn(async move {
                    if let Err(e) = os.graceful_reboot().await {
                        error!("graceful reboot failed: {:#}", e);
                    }
                });
                Ok(())
            }
            other => Err(anyhow!("unknown directive '{}'", other)),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::execution::runner::ScriptRunner;
    use crate::ledger::ExecutionLedger;
    use crate::lifecycle::{reboot_channel, DrainTargets, LifecycleOrchestrator, LifecycleState};
    use crate::ports::standalone::{NoDataMonitor, NoMetricsStore, NoWorkloads};
    use crate::ports::DispatchManager;
    use crate::metrics::SystemMetricsSampler;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        config: Arc<ConfigurationManager>,
        executions: ExecutionManager,
        router: DirectiveRouter,
        orchestrator: Option<LifecycleOrchestrator>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(ExecutionLedger::open(dir.path().join("executions")).unwrap());
        let executions = ExecutionManager::new(
            ledger,
            ScriptRunner::new(vec!["bash".into(), "-c".into()], Duration::from_secs(5)),
        );
        let config = Arc::new(ConfigurationManager::new("dev-1"));
        let (handle, requests) = reboot_channel();
        let orchestrator = LifecycleOrchestrator::new(
            DrainTargets {
                workloads: Arc::new(NoWorkloads::new("dev-1")),
                data_monitor: Arc::new(NoDataMonitor),
                system_metrics: Arc::new(SystemMetricsSampler::new(Duration::from_secs(60))),
                metrics_store: Arc::new(NoMetricsStore),
                heartbeat: Arc::new(SystemMetricsSampler::new(Duration::from_secs(60))),
                dispatch: Some(Arc::new(executions.clone())),
            },
            requests,
        );
        let os = Arc::new(DeviceOs::new(dir.path(), handle).with_reboot_command(vec!["true".into()]));
        let router = DirectiveRouter::new(Arc::clone(&config), executions.clone(), os);
        Fixture {
            _dir: dir,
            config,
            executions,
            router,
            orchestrator: Some(orchestrator),
        }
    }

    fn directive(name: &str, content: serde_json::Value) -> DataMessage {
        DataMessage::new(name, content)
    }

    #[tokio::test]
    async fn test_configuration_directive_updates_manager() {
        let f = fixture();
        f.router
            .handle(directive(
                "configuration",
                json!({
                    "device_id": "dev-1",
                    "version": 4,
                    "configuration": {"heartbeat": {"period_seconds": 15}}
                }),
            ))
            .unwrap();
        assert_eq!(f.config.configuration_version(), 4);
        assert_eq!(f.config.device_configuration().heartbeat_period_secs(), 15);
    }

    #[tokio::test]
    async fn test_execution_directive_dispatches() {
        let f = fixture();
        f.router
            .handle(directive("execution", json!({"name": "hello", "content": "echo hi"})))
            .unwrap();
        f.executions.wait_for_completion().await;
        assert_eq!(f.executions.ledger().get_status("hello").as_deref(), Some("Succeeded"));
    }

    #[tokio::test]
    async fn test_reboot_directive_drains() {
        let mut f = fixture();
        let orchestrator = f.orchestrator.take().unwrap();
        let mut state = orchestrator.state();
        tokio::spawn(orchestrator.run());

        f.router.handle(directive("reboot", json!({}))).unwrap();
        state
            .wait_for(|s| *s == LifecycleState::Completed)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_directives_fail() {
        let f = fixture();
        assert!(f.router.handle(directive("selfdestruct", json!({}))).is_err());
        assert!(f.router.handle(directive("execution", json!({"name": 3}))).is_err());
    }
}
