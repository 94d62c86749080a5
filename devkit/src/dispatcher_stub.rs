/*!
Mock dispatcher channel for development without a broker

Records every `DataMessage` sent and answers with scripted replies, so the
heartbeat and registration paths can be tested without MQTT.
*/

use anyhow::Result;
use async_trait::async_trait;
use fleetlink_agent::dispatcher::{DataMessage, DispatcherClient, DispatcherResponse, TransportError};
use fleetlink_agent::models::HeartbeatReport;
use fleetlink_agent::ports::Registration;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One scripted answer to a `send`
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Non-empty response embedding this status code
    Status(u16),
    /// Call completes without a reply
    Empty,
    /// Transport failure
    Error(String),
    /// Answer only after this long (for timeout tests)
    Delayed(Duration, u16),
}

/// Mock dispatcher replaying `ScriptedReply`s, falling back to 200
#[derive(Clone, Default)]
pub struct MockDispatcher {
    sent: Arc<Mutex<Vec<DataMessage>>>,
    replies: Arc<Mutex<VecDeque<ScriptedReply>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue replies, consumed in order by subsequent sends
    pub fn script<I: IntoIterator<Item = ScriptedReply>>(&self, replies: I) -> &Self {
        self.replies.lock().extend(replies);
        self
    }

    pub fn sent_messages(&self) -> Vec<DataMessage> {
        self.sent.lock().clone()
    }

    pub fn find_by_directive(&self, directive: &str) -> Vec<DataMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.directive == directive)
            .cloned()
            .collect()
    }

    /// Every heartbeat sent so far, parsed
    pub fn heartbeats(&self) -> Result<Vec<HeartbeatReport>> {
        self.find_by_directive("heartbeat")
            .into_iter()
            .map(|m| serde_json::from_value(m.content).map_err(anyhow::Error::from))
            .collect()
    }

    /// Highest number of sends observed running at the same time
    pub fn max_concurrent_sends(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
        self.replies.lock().clear();
    }

    fn reply(message: &DataMessage, status: u16) -> Option<DispatcherResponse> {
        Some(DispatcherResponse {
            message_id: message.message_id.clone(),
            response: Some(json!({ "status_code": status })),
        })
    }
}

#[async_trait]
impl DispatcherClient for MockDispatcher {
    async fn send(&self, message: &DataMessage) -> Result<Option<DispatcherResponse>, TransportError> {
        self.sent.lock().push(message.clone());
        let reply = self.replies.lock().pop_front().unwrap_or(ScriptedReply::Status(200));
        log::info!("[MOCK] {} ({}) -> {:?}", message.directive, message.message_id, reply);

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let result = match reply {
            ScriptedReply::Status(code) => Ok(Self::reply(message, code)),
            ScriptedReply::Empty => Ok(None),
            ScriptedReply::Error(e) => Err(TransportError::Rpc(e)),
            ScriptedReply::Delayed(delay, code) => {
                tokio::time::sleep(delay).await;
                Ok(Self::reply(message, code))
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Registration collaborator counting its calls
#[derive(Clone, Default)]
pub struct MockRegistration {
    calls: Arc<AtomicUsize>,
    fail: bool,
}

impl MockRegistration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            calls: Arc::default(),
            fail: true,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Registration for MockRegistration {
    async fn register_device(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("registration refused");
        }
        Ok(())
    }
}
