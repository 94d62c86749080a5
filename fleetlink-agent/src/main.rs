//! FleetLink Agent - edge device agent
//!
//! Wires the agent together:
//! - MQTT dispatcher channel and device registration
//! - Heartbeat coordinator driven by the device configuration
//! - Execution ledger and dispatch
//! - Lifecycle orchestrator draining the device before reboots

use anyhow::{Context, Result};
use fleetlink_agent::config::{AgentConfig, ConfigurationManager};
use fleetlink_agent::directives::DirectiveRouter;
use fleetlink_agent::execution::runner::ScriptRunner;
use fleetlink_agent::execution::ExecutionManager;
use fleetlink_agent::hardware::{primary_device_id, HardwareProbe, HostHardwareProbe};
use fleetlink_agent::heartbeat::{HeartbeatService, HeartbeatSources};
use fleetlink_agent::ledger::ExecutionLedger;
use fleetlink_agent::lifecycle::{reboot_channel, DrainTargets, LifecycleOrchestrator};
use fleetlink_agent::metrics::{SystemMetricsSampler, DEFAULT_SAMPLE_INTERVAL};
use fleetlink_agent::os::DeviceOs;
use fleetlink_agent::ports::standalone::{NoDataMonitor, NoMetricsStore, NoWorkloads};
use fleetlink_agent::ports::{DispatchManager, Registration};
use fleetlink_agent::transport::{MqttDispatcher, MqttRegistration};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn resolve_device_id(config: &AgentConfig, probe: &HostHardwareProbe) -> Result<String> {
    if let Some(id) = &config.agent.device_id {
        return Ok(id.clone());
    }
    let snapshot = probe.mutable_snapshot().context("Failed to discover network interfaces")?;
    primary_device_id(snapshot.interfaces.as_deref().unwrap_or_default())
        .context("No network interface to derive a device id from; set agent.device_id")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fleetlink_agent=info")),
        )
        .init();

    info!("FleetLink Agent v{} starting...", env!("CARGO_PKG_VERSION"));

    let agent_config = AgentConfig::load().await.context("Failed to load agent config")?;
    let hardware = Arc::new(HostHardwareProbe::new());
    let device_id = resolve_device_id(&agent_config, &hardware)?;
    info!("DeviceID: {}", device_id);

    let ledger = Arc::new(
        ExecutionLedger::open(agent_config.executions_dir()).context("Failed to open execution ledger")?,
    );
    let executions = ExecutionManager::new(ledger, ScriptRunner::from_settings(&agent_config.execution));

    let config = Arc::new(ConfigurationManager::new(&device_id));
    let (dispatcher, inbound) = MqttDispatcher::connect(&agent_config.mqtt, &device_id);
    let send_timeout = agent_config.heartbeat.send_timeout();
    let registration = Arc::new(MqttRegistration::new(
        &device_id,
        dispatcher.clone(),
        hardware.clone(),
        Arc::clone(&config),
        send_timeout,
    ));

    let workloads = Arc::new(NoWorkloads::new(&device_id));
    let data_monitor = Arc::new(NoDataMonitor);
    let system_metrics = Arc::new(SystemMetricsSampler::new(DEFAULT_SAMPLE_INTERVAL));
    let dispatch: Arc<dyn DispatchManager> = Arc::new(executions.clone());

    let (reboot, reboot_requests) = reboot_channel();
    let os = Arc::new(DeviceOs::new(agent_config.device_data_dir(), reboot));

    let heartbeat = HeartbeatService::new(
        HeartbeatSources {
            config: Arc::clone(&config),
            workloads: workloads.clone(),
            dispatch: Some(dispatch.clone()),
            data_monitor: data_monitor.clone(),
            hardware,
            os: os.clone(),
        },
        dispatcher,
        registration.clone(),
        send_timeout,
    );

    let orchestrator = LifecycleOrchestrator::new(
        DrainTargets {
            workloads,
            data_monitor,
            system_metrics: system_metrics.clone(),
            metrics_store: Arc::new(NoMetricsStore),
            heartbeat: Arc::new(heartbeat.clone()),
            dispatch: Some(dispatch),
        },
        reboot_requests,
    );

    // init order follows registration order
    config.register_observer(system_metrics.clone());
    config.register_observer(Arc::new(heartbeat.clone()));
    config.init_all().context("Failed to initialise subsystems")?;

    orchestrator.spawn();
    tokio::spawn(DirectiveRouter::new(Arc::clone(&config), executions.clone(), os).run(inbound));

    let resumed = executions.execute_pending();
    if resumed > 0 {
        info!("resumed {} interrupted executions", resumed);
    }

    if config.is_initial_config() {
        // a successful registration delivers a configuration, which arms the heartbeat
        if let Err(e) = registration.register_device().await {
            warn!("initial registration failed: {:#}", e);
        }
    }
    if !heartbeat.has_started() {
        heartbeat.start();
    }

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("shutting down, waiting for in-flight executions");
    heartbeat.stop();
    executions.wait_for_completion().await;
    info!("FleetLink Agent stopped");
    Ok(())
}
