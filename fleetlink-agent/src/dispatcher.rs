//! Dispatcher channel contract
//!
//! Request/response RPC to the upstream dispatcher. The transport itself lives
//! elsewhere (see `transport`); this module defines the message envelope, the
//! channel trait and how the embedded application status is read back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Embedded status code signalling expired device credentials
pub const STATUS_UNAUTHORIZED: u16 = 401;

/// Directive under which heartbeats are sent
pub const HEARTBEAT_DIRECTIVE: &str = "heartbeat";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("empty response received, host may not be reachable")]
    Unreachable,
    #[error("dispatcher did not answer within {0:?}")]
    Timeout(Duration),
    #[error("RPC failure: {0}")]
    Rpc(String),
    #[error("malformed dispatcher response: {0}")]
    MalformedResponse(#[source] serde_json::Error),
    #[error("cannot encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Outgoing (or inbound) data envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataMessage {
    pub message_id: String,
    pub directive: String,
    pub content: serde_json::Value,
}

impl DataMessage {
    pub fn new(directive: &str, content: serde_json::Value) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            directive: directive.to_string(),
            content,
        }
    }
}

/// Raw reply to a `DataMessage`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherResponse {
    pub message_id: String,
    #[serde(default)]
    pub response: Option<serde_json::Value>,
}

/// Application status embedded in a non-empty response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseStatus {
    #[serde(alias = "StatusCode")]
    pub status_code: u16,
    #[serde(default, alias = "Body")]
    pub body: Option<serde_json::Value>,
}

impl DispatcherResponse {
    /// No response, a null one, or an empty string all mean nobody answered
    pub fn is_empty(&self) -> bool {
        match &self.response {
            None | Some(serde_json::Value::Null) => true,
            Some(serde_json::Value::String(s)) => s.is_empty(),
            Some(_) => false,
        }
    }

    /// Parse the embedded status; a JSON string holding a document is accepted too
    pub fn status(&self) -> Result<ResponseStatus, TransportError> {
        let value = self.response.clone().unwrap_or(serde_json::Value::Null);
        let parsed = match value {
            serde_json::Value::String(raw) => serde_json::from_str(&raw),
            other => serde_json::from_value(other),
        };
        parsed.map_err(TransportError::MalformedResponse)
    }
}

/// RPC channel to the dispatcher
#[async_trait]
pub trait DispatcherClient: Send + Sync {
    /// One round trip. `Ok(None)` means the call completed without a reply.
    async fn send(&self, message: &DataMessage) -> Result<Option<DispatcherResponse>, TransportError>;
}
