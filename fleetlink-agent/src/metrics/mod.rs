//! System metrics sampling
//!
//! Periodically samples CPU, memory and uptime with sysinfo and keeps the
//! latest sample around for whoever wants to ship it. Sampling starts when the
//! configuration manager initialises its observers; deregistering stops it.

use crate::config::{ConfigurationObserver, DeviceConfigurationMessage};
use crate::ports::{Drainable, SystemMetricsCollector};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
    pub sampled_at: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct CpuMetrics {
    pub percent: f32,
    pub load_avg: [f64; 3], // [1min, 5min, 15min]
    pub core_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryMetrics {
    pub total_mb: u64,
    pub used_mb: u64,
    pub available_mb: u64,
    pub percent_used: f32,
}

impl SystemMetrics {
    /// Take one sample from an already refreshed `System`
    pub fn sample(sys: &System) -> Self {
        Self {
            sampled_at: Utc::now(),
            uptime_seconds: System::uptime(),
            cpu: CpuMetrics::collect(sys),
            memory: MemoryMetrics::collect(sys),
        }
    }
}

impl CpuMetrics {
    fn collect(sys: &System) -> Self {
        let load_avg = if cfg!(unix) {
            let load = System::load_average();
            [load.one, load.five, load.fifteen]
        } else {
            [0.0, 0.0, 0.0]
        };
        Self {
            percent: sys.global_cpu_info().cpu_usage(),
            load_avg,
            core_count: sys.cpus().len(),
        }
    }
}

impl MemoryMetrics {
    fn collect(sys: &System) -> Self {
        let total_bytes = sys.total_memory();
        let available_bytes = sys.available_memory();
        let used_bytes = total_bytes.saturating_sub(available_bytes);

        let percent_used = if total_bytes > 0 {
            (used_bytes as f32 / total_bytes as f32) * 100.0
        } else {
            0.0
        };

        Self {
            total_mb: total_bytes / (1024 * 1024),
            used_mb: used_bytes / (1024 * 1024),
            available_mb: available_bytes / (1024 * 1024),
            percent_used,
        }
    }
}

struct Sampler {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Background sysinfo sampler
pub struct SystemMetricsSampler {
    interval: Duration,
    latest: Arc<RwLock<Option<SystemMetrics>>>,
    task: Mutex<Option<Sampler>>,
}

impl SystemMetricsSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            latest: Arc::new(RwLock::new(None)),
            task: Mutex::new(None),
        }
    }

    /// Start sampling; a second call is a no-op. Needs a tokio runtime.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let (stop, mut stop_rx) = oneshot::channel();
        let latest = Arc::clone(&self.latest);
        let period = self.interval;
        let handle = tokio::spawn(async move {
            let mut sys = System::new();
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                }
                sys.refresh_cpu();
                sys.refresh_memory();
                let sample = SystemMetrics::sample(&sys);
                debug!(
                    "system metrics: cpu {:.1}%, memory {:.1}%",
                    sample.cpu.percent, sample.memory.percent_used
                );
                *latest.write() = Some(sample);
            }
        });

        info!("system metrics sampling every {:?}", period);
        *task = Some(Sampler { stop, handle });
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    pub fn latest(&self) -> Option<SystemMetrics> {
        self.latest.read().clone()
    }
}

#[async_trait]
impl Drainable for SystemMetricsSampler {
    async fn deregister(&self) -> Result<()> {
        let task = self.task.lock().take();
        if let Some(Sampler { stop, handle }) = task {
            let _ = stop.send(());
            handle.await?;
            info!("system metrics sampling stopped");
        }
        Ok(())
    }
}

impl SystemMetricsCollector for SystemMetricsSampler {}

impl ConfigurationObserver for SystemMetricsSampler {
    fn name(&self) -> &str {
        "system-metrics"
    }

    fn init(&self, _config: &DeviceConfigurationMessage) -> Result<()> {
        self.start();
        Ok(())
    }

    fn update(&self, config: &DeviceConfigurationMessage) -> Result<()> {
        // sampling period is local; a drained sampler stays stopped
        debug!("system metrics unaffected by configuration version {}", config.version);
        Ok(())
    }
}
