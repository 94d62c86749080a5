//! Configuration management
//!
//! Handles:
//! - Agent bootstrap settings (TOML file, OS-specific location)
//! - Device configuration pushed by the fleet controller
//! - Fan-out of device configuration changes to registered observers

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Heartbeat period used when none (or a non-positive one) is configured
pub const DEFAULT_HEARTBEAT_PERIOD_SECS: i64 = 60;

/// Environment variable overriding the config file location
pub const CONFIG_PATH_ENV: &str = "FLEETLINK_AGENT_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub mqtt: MqttConfig,
    pub agent: AgentInfo,
    pub heartbeat: HeartbeatSettings,
    pub execution: ExecutionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Falls back to the primary MAC address when unset
    pub device_id: Option<String>,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    /// Upper bound for one dispatcher round trip
    pub send_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Interpreter the artifacts are handed to, e.g. `["bash", "-c"]`
    pub interpreter: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig {
                broker_host: "127.0.0.1".to_string(),
                broker_port: 1883,
                client_id: None,
                keep_alive_secs: 30,
            },
            agent: AgentInfo {
                device_id: None,
                data_dir: PathBuf::from("/var/local/fleetlink"),
            },
            heartbeat: HeartbeatSettings { send_timeout_ms: 1000 },
            execution: ExecutionSettings {
                interpreter: vec!["bash".to_string(), "-c".to_string()],
                timeout_secs: 600,
            },
        }
    }
}

impl HeartbeatSettings {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl AgentConfig {
    /// Load config from `$FLEETLINK_AGENT_CONFIG` or the OS-specific location
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;

        if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            let config: AgentConfig = toml::from_str(&content)
                .with_context(|| format!("Invalid config file {}", config_path.display()))?;
            info!("Loaded agent config from {}", config_path.display());
            Ok(config)
        } else {
            warn!("No config at {}, using defaults", config_path.display());
            Ok(Self::default())
        }
    }

    /// Get config file path
    pub fn config_file_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Ok(PathBuf::from(path));
        }

        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("fleetlink-agent");
        path.push("config.toml");
        Ok(path)
    }

    pub fn device_data_dir(&self) -> PathBuf {
        self.agent.data_dir.join("device")
    }

    pub fn executions_dir(&self) -> PathBuf {
        self.agent.data_dir.join("deviceExecutions")
    }
}

/// Scope of the hardware section of a heartbeat
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareScope {
    #[default]
    Full,
    Delta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub include: bool,
    #[serde(default)]
    pub scope: HardwareScope,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfiguration {
    pub period_seconds: i64,
    #[serde(default)]
    pub hardware_profile: HardwareProfile,
}

/// Device configuration as delivered by the controller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfiguration {
    #[serde(default)]
    pub heartbeat: Option<HeartbeatConfiguration>,
}

impl DeviceConfiguration {
    /// Effective heartbeat period; missing or non-positive values become 60s
    pub fn heartbeat_period_secs(&self) -> i64 {
        match &self.heartbeat {
            Some(hb) if hb.period_seconds > 0 => hb.period_seconds,
            _ => DEFAULT_HEARTBEAT_PERIOD_SECS,
        }
    }

    pub fn hardware_profile(&self) -> HardwareProfile {
        self.heartbeat
            .as_ref()
            .map(|hb| hb.hardware_profile.clone())
            .unwrap_or_default()
    }
}

/// Versioned configuration envelope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfigurationMessage {
    pub device_id: String,
    pub version: u64,
    pub configuration: DeviceConfiguration,
}

/// Capability implemented by every subsystem that reacts to configuration
pub trait ConfigurationObserver: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Called once at startup, in registration order
    fn init(&self, config: &DeviceConfigurationMessage) -> Result<()>;

    /// Called on every configuration change, in registration order
    fn update(&self, config: &DeviceConfigurationMessage) -> Result<()>;
}

/// Holds the live device configuration and broadcasts changes.
///
/// Observers are a plain ordered list: registration order is `init` order
/// and `update` order.
pub struct ConfigurationManager {
    current: RwLock<DeviceConfigurationMessage>,
    observers: RwLock<Vec<Arc<dyn ConfigurationObserver>>>,
}

impl ConfigurationManager {
    pub fn new(device_id: &str) -> Self {
        Self::with_initial(DeviceConfigurationMessage {
            device_id: device_id.to_string(),
            ..DeviceConfigurationMessage::default()
        })
    }

    pub fn with_initial(message: DeviceConfigurationMessage) -> Self {
        Self {
            current: RwLock::new(message),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn register_observer(&self, observer: Arc<dyn ConfigurationObserver>) {
        debug!("registering configuration observer {}", observer.name());
        self.observers.write().push(observer);
    }

    pub fn observer_names(&self) -> Vec<String> {
        self.observers.read().iter().map(|o| o.name().to_string()).collect()
    }

    /// Call `init` on every observer; the first failure is returned
    pub fn init_all(&self) -> Result<()> {
        let message = self.current.read().clone();
        for observer in self.observers() {
            observer
                .init(&message)
                .with_context(|| format!("observer {} failed to init", observer.name()))?;
        }
        Ok(())
    }

    /// Store a new configuration and broadcast it. Stale versions are ignored;
    /// an observer failing does not stop the others from being updated.
    pub fn update(&self, message: DeviceConfigurationMessage) -> Result<()> {
        {
            let mut current = self.current.write();
            if message.version < current.version {
                warn!(
                    "ignoring stale configuration version {} (current {}). DeviceID: {}",
                    message.version, current.version, current.device_id
                );
                return Ok(());
            }
            if *current == message {
                debug!("configuration unchanged at version {}", message.version);
                return Ok(());
            }
            *current = message.clone();
        }

        info!(
            "configuration updated to version {}. DeviceID: {}",
            message.version, message.device_id
        );
        let mut failures = Vec::new();
        for observer in self.observers() {
            if let Err(e) = observer.update(&message) {
                error!("observer {} failed to apply configuration: {:#}", observer.name(), e);
                failures.push(observer.name().to_string());
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "configuration version {} rejected by: {}",
                message.version,
                failures.join(", ")
            ))
        }
    }

    pub fn device_configuration(&self) -> DeviceConfiguration {
        self.current.read().configuration.clone()
    }

    pub fn configuration_version(&self) -> u64 {
        self.current.read().version
    }

    pub fn device_configuration_message(&self) -> DeviceConfigurationMessage {
        self.current.read().clone()
    }

    /// True until the controller delivered a first configuration
    pub fn is_initial_config(&self) -> bool {
        self.current.read().version == 0
    }

    /// Snapshot so no lock is held while observers run
    fn observers(&self) -> Vec<Arc<dyn ConfigurationObserver>> {
        self.observers.read().clone()
    }
}
