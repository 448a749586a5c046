use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ws::error::WsError;

const PONG: &str = "pong";
const SUBSCRIPTION_SUCCESS: &str = "subscription_success";
const UNSUBSCRIPTION_SUCCESS: &str = "unsubscription_success";
const ERROR: &str = "error";

/// A frame received from the server.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub data: Value,
    /// Application routing tag, e.g. `market_data_AAPL`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// How an [`InboundMessage`] is handled.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    /// Heartbeat acknowledgement
    Pong,
    SubscriptionSuccess,
    UnsubscriptionSuccess,
    /// Server-reported error
    Error,
    /// Anything else; delivered to handlers
    Data,
}

impl InboundMessage {
    #[must_use]
    pub fn new<S: Into<String>>(msg_type: S, data: Value) -> Self {
        Self {
            msg_type: msg_type.into(),
            data,
            channel: None,
            id: None,
        }
    }

    #[must_use]
    pub fn with_channel<S: Into<String>>(mut self, channel: S) -> Self {
        self.channel = Some(channel.into());
        self
    }

    #[must_use]
    pub fn kind(&self) -> InboundKind {
        match self.msg_type.as_str() {
            PONG => InboundKind::Pong,
            SUBSCRIPTION_SUCCESS => InboundKind::SubscriptionSuccess,
            UNSUBSCRIPTION_SUCCESS => InboundKind::UnsubscriptionSuccess,
            ERROR => InboundKind::Error,
            _ => InboundKind::Data,
        }
    }

    /// The `data.message` of an error frame, falling back to the raw payload.
    #[must_use]
    pub fn error_message(&self) -> String {
        match &self.data {
            Value::Object(map) => match map.get("message") {
                Some(Value::String(message)) => message.clone(),
                Some(other) => other.to_string(),
                None => self.data.to_string(),
            },
            Value::String(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Parse a raw frame into zero or more messages.
///
/// Accepts a single object or an array of objects. Empty or whitespace-only frames are
/// treated as keepalives and yield nothing.
pub fn parse_messages(bytes: &[u8]) -> crate::Result<Vec<InboundMessage>> {
    let trimmed = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map_or(&[][..], |start| &bytes[start..]);

    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let parsed = if trimmed.first() == Some(&b'[') {
        serde_json::from_slice(trimmed)
    } else {
        serde_json::from_slice(trimmed).map(|msg: InboundMessage| vec![msg])
    };

    parsed.map_err(|e| WsError::MessageParse(Arc::new(e)).into())
}
