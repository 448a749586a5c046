#![expect(
    clippy::module_name_repetitions,
    reason = "Request types deliberately include the module name for clarity"
)]

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::Result;
use crate::error::Error;

/// Frame type of a subscribe request.
pub const SUBSCRIBE: &str = "subscribe";
/// Frame type of an unsubscribe request.
pub const UNSUBSCRIBE: &str = "unsubscribe";
/// Frame type of a heartbeat probe.
pub const PING: &str = "ping";

/// A logical subscription: a set of symbols crossed with a set of data types, optionally
/// narrowed to one interval (e.g. K-line resolution).
///
/// Both sets are ordered and deduplicated, so requests built from permuted inputs compare
/// equal and share one [`key`](Self::key).
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    /// Instrument symbols (e.g. `AAPL`, `BTC-USD`)
    pub symbols: BTreeSet<String>,
    /// Data types (e.g. `tick`, `quote`, `kline`)
    #[serde(rename = "dataTypes")]
    pub data_types: BTreeSet<String>,
    /// Optional interval such as `1m`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

impl SubscriptionRequest {
    /// Build a request from any iterables of symbols and data types.
    ///
    /// ```
    /// use market_stream_client::ws::SubscriptionRequest;
    ///
    /// let a = SubscriptionRequest::new(["MSFT", "AAPL"], ["tick"]);
    /// let b = SubscriptionRequest::new(["AAPL", "MSFT", "AAPL"], ["tick"]);
    /// assert_eq!(a.key(), b.key());
    /// ```
    #[must_use]
    pub fn new<I, S, J, T>(symbols: I, data_types: J) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        J: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            symbols: symbols.into_iter().map(Into::into).collect(),
            data_types: data_types.into_iter().map(Into::into).collect(),
            interval: None,
        }
    }

    #[must_use]
    pub fn with_interval<S: Into<String>>(mut self, interval: S) -> Self {
        self.interval = Some(interval.into());
        self
    }

    /// Canonical identity of this request: `symbols|data_types|interval`.
    #[must_use]
    pub fn key(&self) -> String {
        let symbols = self
            .symbols
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let data_types = self
            .data_types
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "{symbols}|{data_types}|{}",
            self.interval.as_deref().unwrap_or_default()
        )
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            return Err(Error::validation("symbols cannot be empty"));
        }
        if self.data_types.is_empty() {
            return Err(Error::validation("data types cannot be empty"));
        }
        Ok(())
    }
}

/// A frame sent to the server.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub data: Value,
    /// Correlation id echoed back by acknowledgements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl OutboundMessage {
    #[must_use]
    pub fn new<S: Into<String>>(msg_type: S, data: Value) -> Self {
        Self {
            msg_type: msg_type.into(),
            data,
            id: None,
        }
    }

    #[must_use]
    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Heartbeat probe stamped with the current time in milliseconds.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(
            PING,
            json!({ "timestamp": chrono::Utc::now().timestamp_millis() }),
        )
    }

    #[must_use]
    pub fn subscribe(request: &SubscriptionRequest) -> Self {
        Self::control(SUBSCRIBE, request)
    }

    #[must_use]
    pub fn unsubscribe(request: &SubscriptionRequest) -> Self {
        Self::control(UNSUBSCRIBE, request)
    }

    fn control(msg_type: &str, request: &SubscriptionRequest) -> Self {
        // Serializing string sets cannot fail
        let data = serde_json::to_value(request).unwrap_or(Value::Null);
        Self::new(msg_type, data).with_id(Uuid::new_v4().to_string())
    }

    /// Encode as a JSON text frame.
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
