//! MQTT dispatcher transport
//!
//! Request/response over MQTT:
//! - Outgoing `DataMessage`s are published to `fleetlink/devices/{id}/data`
//! - Replies arrive on `fleetlink/devices/{id}/response` and are matched to the
//!   waiting sender by `message_id`
//! - Controller directives arrive on `fleetlink/devices/{id}/directive` and are
//!   handed out through an mpsc receiver
//!
//! Registration rides the same channel under the `registration` directive.

use crate::config::{ConfigurationManager, DeviceConfigurationMessage, MqttConfig};
use crate::dispatcher::{DataMessage, DispatcherClient, DispatcherResponse, TransportError};
use crate::hardware::HardwareProbe;
use crate::models::Interface;
use crate::ports::Registration;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

pub const REGISTRATION_DIRECTIVE: &str = "registration";

const INBOUND_CAPACITY: usize = 32;

/// Per-device topic set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub data: String,
    pub response: String,
    pub directive: String,
}

impl Topics {
    pub fn for_device(device_id: &str) -> Self {
        let base = format!("fleetlink/devices/{}", device_id);
        Self {
            data: format!("{}/data", base),
            response: format!("{}/response", base),
            directive: format!("{}/directive", base),
        }
    }
}

type PendingReplies = Arc<Mutex<HashMap<String, oneshot::Sender<DispatcherResponse>>>>;

/// Routes inbound publishes to waiting senders or to the directive queue
struct InboundRouter {
    topics: Topics,
    pending: PendingReplies,
    directives: mpsc::Sender<DataMessage>,
}

impl InboundRouter {
    fn handle(&self, topic: &str, payload: &[u8]) {
        if topic == self.topics.response {
            match serde_json::from_slice::<DispatcherResponse>(payload) {
                Ok(response) => {
                    let waiter = self.pending.lock().remove(&response.message_id);
                    match waiter {
                        Some(waiter) => {
                            let _ = waiter.send(response);
                        }
                        None => debug!("dropping reply to unknown message {}", response.message_id),
                    }
                }
                Err(e) => warn!("invalid dispatcher response on {}: {}", topic, e),
            }
        } else if topic == self.topics.directive {
            match serde_json::from_slice::<DataMessage>(payload) {
                Ok(message) => {
                    if let Err(e) = self.directives.try_send(message) {
                        error!("directive queue unavailable, dropping directive: {}", e);
                    }
                }
                Err(e) => warn!("invalid directive on {}: {}", topic, e),
            }
        } else {
            debug!("ignoring message on {}", topic);
        }
    }
}

/// Removes the pending entry when a send is abandoned (timeout, error)
struct PendingGuard {
    pending: PendingReplies,
    message_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.message_id);
    }
}

pub struct MqttDispatcher {
    client: AsyncClient,
    topics: Topics,
    pending: PendingReplies,
}

impl MqttDispatcher {
    /// Create the client and spawn its event loop. Returns the dispatcher and
    /// the stream of inbound directives.
    pub fn connect(config: &MqttConfig, device_id: &str) -> (Arc<Self>, mpsc::Receiver<DataMessage>) {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("fleetlink-agent-{}", device_id));
        let mut mqtt_options = MqttOptions::new(client_id, &config.broker_host, config.broker_port);
        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        mqtt_options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10);
        let topics = Topics::for_device(device_id);
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let (directives, inbound) = mpsc::channel(INBOUND_CAPACITY);

        let router = InboundRouter {
            topics: topics.clone(),
            pending: Arc::clone(&pending),
            directives,
        };
        let subscriber = client.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        // clean session: subscriptions are gone after every reconnect
                        for topic in [&router.topics.response, &router.topics.directive] {
                            if let Err(e) = subscriber.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                                error!("cannot subscribe to {}: {}", topic, e);
                            }
                        }
                        info!("connected to broker, listening on {}", router.topics.directive);
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        router.handle(&publish.topic, &publish.payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT connection error: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        (
            Arc::new(Self {
                client,
                topics,
                pending,
            }),
            inbound,
        )
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }
}

#[async_trait]
impl DispatcherClient for MqttDispatcher {
    async fn send(&self, message: &DataMessage) -> Result<Option<DispatcherResponse>, TransportError> {
        let payload = serde_json::to_vec(message).map_err(TransportError::Encode)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(message.message_id.clone(), tx);
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            message_id: message.message_id.clone(),
        };

        self.client
            .publish(self.topics.data.as_str(), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Rpc(e.to_string()))?;
        debug!("published {} ({})", message.directive, message.message_id);

        match rx.await {
            Ok(response) => Ok(Some(response)),
            Err(_) => Err(TransportError::Rpc("reply channel closed".to_string())),
        }
    }
}

#[derive(Debug, Serialize)]
struct RegistrationMessage {
    device_id: String,
    hostname: String,
    os: String,
    architecture: String,
    interfaces: Vec<Interface>,
    version: String,
    timestamp: DateTime<Utc>,
}

/// Registers the device through the dispatcher channel and applies the
/// configuration the controller answers with
pub struct MqttRegistration {
    device_id: String,
    dispatcher: Arc<dyn DispatcherClient>,
    hardware: Arc<dyn HardwareProbe>,
    config: Arc<ConfigurationManager>,
    timeout: Duration,
}

impl MqttRegistration {
    pub fn new(
        device_id: &str,
        dispatcher: Arc<dyn DispatcherClient>,
        hardware: Arc<dyn HardwareProbe>,
        config: Arc<ConfigurationManager>,
        timeout: Duration,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            dispatcher,
            hardware,
            config,
            timeout,
        }
    }

    fn registration_message(&self) -> RegistrationMessage {
        let (hostname, interfaces) = match self.hardware.mutable_snapshot() {
            Ok(snapshot) => (
                snapshot.hostname.unwrap_or_default(),
                snapshot.interfaces.unwrap_or_default(),
            ),
            Err(e) => {
                warn!("registering without network details: {:#}", e);
                (gethostname::gethostname().to_string_lossy().to_string(), Vec::new())
            }
        };
        RegistrationMessage {
            device_id: self.device_id.clone(),
            hostname,
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            interfaces,
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
impl Registration for MqttRegistration {
    async fn register_device(&self) -> Result<()> {
        let content = serde_json::to_value(self.registration_message())
            .context("Failed to serialize registration message")?;
        let message = DataMessage::new(REGISTRATION_DIRECTIVE, content);

        let response = tokio::time::timeout(self.timeout, self.dispatcher.send(&message))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))??
            .filter(|response| !response.is_empty())
            .ok_or(TransportError::Unreachable)?;

        let status = response.status()?;
        if !(200..300).contains(&status.status_code) {
            return Err(anyhow!("registration rejected with status {}", status.status_code));
        }
        info!("device registered. DeviceID: {}", self.device_id);

        if let Some(body) = status.body {
            match serde_json::from_value::<DeviceConfigurationMessage>(body) {
                Ok(configuration) => self.config.update(configuration)?,
                Err(e) => debug!("registration reply carries no configuration: {}", e),
            }
        }
        Ok(())
    }
}
