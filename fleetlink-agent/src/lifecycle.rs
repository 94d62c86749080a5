//! Lifecycle orchestration
//!
//! Drains every subsystem, in a fixed order, when the OS layer asks for a
//! graceful reboot. A drain step failing is fatal: a half-drained device must
//! not reboot.

use crate::ports::{DataMonitor, DispatchManager, Drainable, MetricsStore, SystemMetricsCollector, WorkloadManager};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStep {
    StopWorkloads,
    DataMonitor,
    SystemMetrics,
    MetricsStore,
    Heartbeat,
    PendingExecutions,
}

impl fmt::Display for DrainStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DrainStep::StopWorkloads => "stop workloads",
            DrainStep::DataMonitor => "deregister data monitor",
            DrainStep::SystemMetrics => "deregister system metrics",
            DrainStep::MetricsStore => "deregister metrics store",
            DrainStep::Heartbeat => "deregister heartbeat",
            DrainStep::PendingExecutions => "wait for executions",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("drain step '{step}' failed: {source:#}")]
pub struct DrainError {
    pub step: DrainStep,
    #[source]
    pub source: anyhow::Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    Draining,
    Completed,
}

/// One reboot request; `completion` is acknowledged once draining finished
#[derive(Debug)]
pub struct RebootRequest {
    pub completion: oneshot::Sender<()>,
}

/// Handle the OS layer uses to ask for a drain
#[derive(Clone)]
pub struct RebootHandle {
    requests: mpsc::Sender<RebootRequest>,
}

impl RebootHandle {
    /// Request a drain and wait until it is acknowledged
    pub async fn request_graceful_reboot(&self) -> anyhow::Result<()> {
        let (completion, done) = oneshot::channel();
        self.requests
            .send(RebootRequest { completion })
            .await
            .map_err(|_| anyhow::anyhow!("lifecycle orchestrator is not running"))?;
        done.await
            .map_err(|_| anyhow::anyhow!("lifecycle orchestrator stopped before draining completed"))
    }
}

/// Receiving side of the reboot channel, consumed by the orchestrator
pub struct RebootRequests {
    receiver: mpsc::Receiver<RebootRequest>,
}

/// Single-slot request channel between the OS layer and the orchestrator
pub fn reboot_channel() -> (RebootHandle, RebootRequests) {
    let (tx, rx) = mpsc::channel(1);
    (RebootHandle { requests: tx }, RebootRequests { receiver: rx })
}

/// Subsystems drained on reboot
pub struct DrainTargets {
    pub workloads: Arc<dyn WorkloadManager>,
    pub data_monitor: Arc<dyn DataMonitor>,
    pub system_metrics: Arc<dyn SystemMetricsCollector>,
    pub metrics_store: Arc<dyn MetricsStore>,
    pub heartbeat: Arc<dyn Drainable>,
    pub dispatch: Option<Arc<dyn DispatchManager>>,
}

pub struct LifecycleOrchestrator {
    targets: DrainTargets,
    requests: mpsc::Receiver<RebootRequest>,
    state: watch::Sender<LifecycleState>,
}

impl LifecycleOrchestrator {
    pub fn new(targets: DrainTargets, requests: RebootRequests) -> Self {
        let (state, _) = watch::channel(LifecycleState::Running);
        Self {
            targets,
            requests: requests.receiver,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Serve reboot requests until every handle is dropped.
    /// Returns the first drain failure; the caller decides how to die.
    pub async fn run(mut self) -> Result<(), DrainError> {
        while let Some(request) = self.requests.recv().await {
            self.state.send_replace(LifecycleState::Draining);
            info!("reboot requested, draining subsystems");

            self.drain().await?;

            self.state.send_replace(LifecycleState::Completed);
            info!("drain completed, handing over to the OS layer");
            if request.completion.send(()).is_err() {
                error!("reboot requester went away before the drain completed");
            }
        }
        Ok(())
    }

    /// Run on its own task; a drain failure terminates the process
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                error!("{}; device cannot be rebooted safely, exiting", e);
                std::process::exit(1);
            }
        })
    }

    async fn drain(&self) -> Result<(), DrainError> {
        let t = &self.targets;
        Self::step(DrainStep::StopWorkloads, t.workloads.stop_workloads().await)?;
        Self::step(DrainStep::DataMonitor, t.data_monitor.deregister().await)?;
        Self::step(DrainStep::SystemMetrics, t.system_metrics.deregister().await)?;
        Self::step(DrainStep::MetricsStore, t.metrics_store.deregister().await)?;
        Self::step(DrainStep::Heartbeat, t.heartbeat.deregister().await)?;

        if let Some(dispatch) = &t.dispatch {
            info!("{}", DrainStep::PendingExecutions);
            dispatch.wait_for_completion().await;
        }
        Ok(())
    }

    fn step(step: DrainStep, result: anyhow::Result<()>) -> Result<(), DrainError> {
        match result {
            Ok(()) => {
                info!("drain: {} done", step);
                Ok(())
            }
            Err(source) => Err(DrainError { step, source }),
        }
    }
}
