//! Heartbeat coordinator
//!
//! Periodically assembles a `HeartbeatReport` from the workload manager, the
//! dispatch manager, the data monitor, the hardware probe and the OS layer, and
//! sends it to the dispatcher.
//!
//! - Interval comes from the live device configuration (default 60s) and is
//!   re-armed whenever a configuration update changes it
//! - Sends are serialized by a dedicated lock so reports never interleave
//! - An unauthorized response triggers one re-registration and one resend of
//!   the same message
//! - The first heartbeat, and the first one after any failed send, carries the
//!   full hardware snapshot instead of a delta

use crate::config::{ConfigurationManager, ConfigurationObserver, DeviceConfigurationMessage, HardwareScope};
use crate::dispatcher::{
    DataMessage, DispatcherClient, DispatcherResponse, TransportError, HEARTBEAT_DIRECTIVE,
    STATUS_UNAUTHORIZED,
};
use crate::hardware::{mutable_delta, HardwareProbe};
use crate::models::{ExecutionStatus, HardwareInfo, HeartbeatReport, HeartbeatStatus, WorkloadStatus};
use crate::ports::{DataMonitor, DispatchManager, Drainable, OsController, Registration, WorkloadManager};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("device credentials expired and the resend failed: {0}")]
    AuthExpired(String),
    #[error("cannot serialize heartbeat: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Everything a heartbeat report is assembled from
pub struct HeartbeatSources {
    pub config: Arc<ConfigurationManager>,
    pub workloads: Arc<dyn WorkloadManager>,
    pub dispatch: Option<Arc<dyn DispatchManager>>,
    pub data_monitor: Arc<dyn DataMonitor>,
    pub hardware: Arc<dyn HardwareProbe>,
    pub os: Arc<dyn OsController>,
}

/// Report assembly plus the cached mutable hardware of the last report
pub struct HeartbeatData {
    sources: HeartbeatSources,
    previous_mutable_hardware: RwLock<Option<HardwareInfo>>,
}

impl HeartbeatData {
    pub fn new(sources: HeartbeatSources) -> Self {
        Self {
            sources,
            previous_mutable_hardware: RwLock::new(None),
        }
    }

    pub fn device_id(&self) -> String {
        self.sources.workloads.device_id()
    }

    /// Assemble a point-in-time report
    pub async fn retrieve_info(&self) -> HeartbeatReport {
        let device_id = self.device_id();
        let config = self.sources.config.device_configuration_message();

        let workloads = match self.sources.workloads.list_workloads().await {
            Ok(workloads) => workloads,
            Err(e) => {
                error!("cannot get workload information. DeviceID: {}; err: {:#}", device_id, e);
                Vec::new()
            }
        };
        let workloads = workloads
            .into_iter()
            .map(|w| WorkloadStatus {
                last_data_upload: self.sources.data_monitor.last_successful_sync_time(&w.name),
                name: w.name,
                status: w.status,
            })
            .collect();

        let executions = self
            .sources
            .dispatch
            .as_ref()
            .map(|dispatch| dispatch.list())
            .unwrap_or_default()
            .into_iter()
            .map(|e| ExecutionStatus {
                last_data_upload: self.sources.data_monitor.last_successful_sync_time(&e.name),
                name: e.name,
                status: e.status,
            })
            .collect();

        let profile = config.configuration.hardware_profile();
        let hardware = if profile.include {
            self.build_hardware_info(profile.scope)
        } else {
            None
        };

        let mut events = self.sources.workloads.pop_events();
        if let Some(dispatch) = &self.sources.dispatch {
            events.extend(dispatch.pop_events());
        }

        HeartbeatReport {
            status: HeartbeatStatus::Up,
            version: config.version,
            workloads,
            executions,
            hardware,
            events,
            upgrade: self.sources.os.upgrade_status(),
        }
    }

    pub fn previous_hardware_info(&self) -> Option<HardwareInfo> {
        self.previous_mutable_hardware.read().clone()
    }

    pub fn set_previous_hardware_info(&self, info: Option<HardwareInfo>) {
        *self.previous_mutable_hardware.write() = info;
    }

    /// Full snapshot when nothing is cached, otherwise the mutable snapshot (or
    /// its delta when `scope` is delta). The cache is only replaced once the
    /// section is fully assembled; the whole step runs under the cache lock.
    fn build_hardware_info(&self, scope: HardwareScope) -> Option<HardwareInfo> {
        let device_id = self.device_id();
        let mut previous = self.previous_mutable_hardware.write();

        let current = match self.sources.hardware.mutable_snapshot() {
            Ok(current) => current,
            Err(e) => {
                error!("cannot create hardware mutable information. DeviceID: {}; err: {:#}", device_id, e);
                return None;
            }
        };

        let info = match previous.as_ref() {
            None => match self.sources.hardware.full_snapshot() {
                Ok(full) => full,
                Err(e) => {
                    error!("cannot get full hardware information. DeviceID: {}; err: {:#}", device_id, e);
                    return Some(current);
                }
            },
            Some(prev) if scope == HardwareScope::Delta => {
                debug!("computing mutable hardware delta (scope = delta). DeviceID: {}", device_id);
                mutable_delta(prev, &current)
            }
            Some(_) => current.clone(),
        };

        *previous = Some(current);
        Some(info)
    }
}

struct Ticker {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

struct Inner {
    data: HeartbeatData,
    dispatcher: Arc<dyn DispatcherClient>,
    registration: Arc<dyn Registration>,
    send_timeout: Duration,
    first_heartbeat: AtomicBool,
    /// Period the running ticker was armed with; -1 before the first arm
    previous_period_secs: AtomicI64,
    ticker: Mutex<Option<Ticker>>,
    send_lock: tokio::sync::Mutex<()>,
}

/// Periodic heartbeat sender
#[derive(Clone)]
pub struct HeartbeatService {
    inner: Arc<Inner>,
}

impl HeartbeatService {
    pub fn new(
        sources: HeartbeatSources,
        dispatcher: Arc<dyn DispatcherClient>,
        registration: Arc<dyn Registration>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                data: HeartbeatData::new(sources),
                dispatcher,
                registration,
                send_timeout,
                first_heartbeat: AtomicBool::new(true),
                previous_period_secs: AtomicI64::new(-1),
                ticker: Mutex::new(None),
                send_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn data(&self) -> &HeartbeatData {
        &self.inner.data
    }

    /// Arm the ticker with the configured interval. Needs a tokio runtime.
    pub fn start(&self) {
        let period = self.inner.data.sources.config.device_configuration().heartbeat_period_secs();
        self.inner.previous_period_secs.store(period, Ordering::SeqCst);
        self.init_ticker(period);
    }

    pub fn has_started(&self) -> bool {
        self.inner.ticker.lock().is_some()
    }

    /// Period of the armed ticker, if any was ever armed
    pub fn current_period(&self) -> Option<Duration> {
        let secs = self.inner.previous_period_secs.load(Ordering::SeqCst);
        (secs > 0).then(|| Duration::from_secs(secs as u64))
    }

    pub fn is_first_heartbeat(&self) -> bool {
        self.inner.first_heartbeat.load(Ordering::SeqCst)
    }

    /// Assemble, send and account for one heartbeat
    pub async fn push_information(&self) -> Result<(), HeartbeatError> {
        self.inner.push_information().await
    }

    /// Stop the ticker. In-flight sends finish on their own.
    pub fn stop(&self) {
        info!("stopping heartbeat ticker. DeviceID: {}", self.inner.data.device_id());
        self.stop_ticker();
    }

    fn init_ticker(&self, period_secs: i64) {
        let period = Duration::from_secs(period_secs.max(1) as u64);
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                }
                // outside the select: stopping never cuts a send short
                if let Err(e) = inner.push_information().await {
                    error!(
                        "heartbeat interval cannot send the data. DeviceID: {}; err: {}",
                        inner.data.device_id(),
                        e
                    );
                }
            }
            debug!("heartbeat ticker exited");
        });

        let previous = self.inner.ticker.lock().replace(Ticker { stop: stop_tx, handle });
        if let Some(previous) = previous {
            let _ = previous.stop.send(());
        }
        info!(
            "the heartbeat was started with interval {:?}. DeviceID: {}",
            period,
            self.inner.data.device_id()
        );
    }

    fn stop_ticker(&self) {
        if let Some(ticker) = self.inner.ticker.lock().take() {
            // the task may already be gone; nothing to do then
            let _ = ticker.stop.send(());
            drop(ticker.handle);
        }
    }
}

impl Inner {
    async fn push_information(&self) -> Result<(), HeartbeatError> {
        let device_id = self.data.device_id();
        let report = self.data.retrieve_info().await;
        debug!("pushInformation: heartbeat version {}; DeviceID: {}", report.version, device_id);

        let message = DataMessage::new(HEARTBEAT_DIRECTIVE, serde_json::to_value(&report)?);
        match self.send(&message).await {
            Ok(()) => {
                if self.first_heartbeat.swap(false, Ordering::SeqCst) {
                    info!("first heartbeat delivered. DeviceID: {}", device_id);
                }
                Ok(())
            }
            Err(e) => {
                // the controller never saw this snapshot: next report starts from full
                self.data.set_previous_hardware_info(None);
                Err(e)
            }
        }
    }

    async fn send(&self, message: &DataMessage) -> Result<(), HeartbeatError> {
        let _serialized = self.send_lock.lock().await;
        let device_id = self.data.device_id();

        let response = self.round_trip(message).await?;
        let status = response.status()?;
        if status.status_code != STATUS_UNAUTHORIZED {
            debug!("heartbeat acknowledged with status {}; DeviceID: {}", status.status_code, device_id);
            return Ok(());
        }

        warn!("dispatcher rejected device credentials, re-registering. DeviceID: {}", device_id);
        if let Err(e) = self.registration.register_device().await {
            warn!("re-registration failed. DeviceID: {}; err: {:#}", device_id, e);
        }

        let retry = self
            .round_trip(message)
            .await
            .map_err(|e| HeartbeatError::AuthExpired(e.to_string()))?;
        match retry.status() {
            Ok(status) if status.status_code == STATUS_UNAUTHORIZED => Err(HeartbeatError::AuthExpired(
                "dispatcher still reports unauthorized".to_string(),
            )),
            Ok(_) => Ok(()),
            Err(e) => Err(HeartbeatError::AuthExpired(e.to_string())),
        }
    }

    /// One bounded call; an absent or empty reply counts as unreachable
    async fn round_trip(&self, message: &DataMessage) -> Result<DispatcherResponse, TransportError> {
        let reply = tokio::time::timeout(self.send_timeout, self.dispatcher.send(message))
            .await
            .map_err(|_| TransportError::Timeout(self.send_timeout))??;
        match reply {
            Some(response) if !response.is_empty() => Ok(response),
            _ => Err(TransportError::Unreachable),
        }
    }
}

impl ConfigurationObserver for HeartbeatService {
    fn name(&self) -> &str {
        "heartbeat"
    }

    /// No-op: every tick reads the live configuration
    fn init(&self, _config: &DeviceConfigurationMessage) -> Result<()> {
        Ok(())
    }

    fn update(&self, config: &DeviceConfigurationMessage) -> Result<()> {
        let period = config.configuration.heartbeat_period_secs();
        let previous = self.inner.previous_period_secs.load(Ordering::SeqCst);
        if previous > 0 && previous == period {
            return Ok(());
        }

        info!(
            "reconfiguring ticker with interval: {}s (was {}s). DeviceID: {}",
            period,
            previous,
            self.inner.data.device_id()
        );
        self.stop_ticker();
        self.inner.previous_period_secs.store(period, Ordering::SeqCst);
        self.init_ticker(period);
        Ok(())
    }
}

#[async_trait]
impl Drainable for HeartbeatService {
    async fn deregister(&self) -> Result<()> {
        self.stop();
        Ok(())
    }
}
