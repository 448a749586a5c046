use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use url::Url;

use super::error::WsError;
use super::reconnect::LinearBackoff;
use crate::Result;
use crate::error::Error;

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// Configuration for a [`Manager`](super::Manager).
///
/// Immutable once handed to the manager; changing transport parameters means building a new
/// manager.
///
/// ```
/// use std::time::Duration;
/// use market_stream_client::ws::Config;
///
/// let config = Config::builder()
///     .url("wss://stream.example.com/ws")
///     .reconnect_interval(Duration::from_secs(2))
///     .max_reconnect_attempts(10)
///     .build();
/// assert!(config.enable_heartbeat);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// WebSocket endpoint (`ws://` or `wss://`)
    #[builder(into)]
    pub url: String,
    /// Sub-protocols offered in the `Sec-WebSocket-Protocol` header
    #[builder(default)]
    pub protocols: Vec<String>,
    /// Interval between `ping` frames while connected
    #[builder(default = DEFAULT_HEARTBEAT_INTERVAL)]
    pub heartbeat_interval: Duration,
    /// Silence after which the connection is considered half-open and force-closed.
    /// Defaults to twice the heartbeat interval when unset.
    pub heartbeat_timeout: Option<Duration>,
    /// Whether silence is detected at all; when false only pings are sent
    #[builder(default = true)]
    pub detect_half_open: bool,
    /// Base reconnect delay; the n-th retry waits `reconnect_interval × n`
    #[builder(default = DEFAULT_RECONNECT_INTERVAL)]
    pub reconnect_interval: Duration,
    /// Retries after which reconnection stops for good
    #[builder(default = DEFAULT_MAX_RECONNECT_ATTEMPTS)]
    pub max_reconnect_attempts: u32,
    /// Deadline for a single connect attempt, including the WebSocket handshake
    #[builder(default = DEFAULT_CONNECT_TIMEOUT)]
    pub connect_timeout: Duration,
    /// Deadline for the close handshake on manual disconnect
    #[builder(default = DEFAULT_DISCONNECT_TIMEOUT)]
    pub disconnect_timeout: Duration,
    #[builder(default = true)]
    pub enable_heartbeat: bool,
    #[builder(default = true)]
    pub enable_reconnect: bool,
    /// Capacity of the channel feeding [`Manager::stream`](super::Manager::stream)
    #[builder(default = DEFAULT_BROADCAST_CAPACITY)]
    pub broadcast_capacity: usize,
}

impl Config {
    /// Configuration with every option at its default.
    #[must_use]
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self::builder().url(url).build()
    }

    /// The silence threshold actually enforced, if any.
    #[must_use]
    pub fn effective_heartbeat_timeout(&self) -> Option<Duration> {
        if !self.detect_half_open {
            return None;
        }
        Some(
            self.heartbeat_timeout
                .unwrap_or_else(|| self.heartbeat_interval.saturating_mul(2)),
        )
    }

    pub(crate) fn backoff(&self) -> LinearBackoff {
        LinearBackoff::new(self.reconnect_interval, self.max_reconnect_attempts)
    }

    /// Checks everything that would otherwise fail at runtime.
    pub(crate) fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "url scheme must be ws or wss, got {}",
                url.scheme()
            )));
        }
        if self.enable_heartbeat && self.heartbeat_interval.is_zero() {
            return Err(Error::validation(
                "heartbeat_interval must be non-zero when heartbeats are enabled",
            ));
        }
        if self.broadcast_capacity == 0 {
            return Err(Error::validation("broadcast_capacity must be non-zero"));
        }
        self.client_request()
            .map(|_request| ())
            .map_err(|e| Error::validation(format!("invalid handshake request: {e}")))
    }

    /// Handshake request for a new connect attempt.
    pub(crate) fn client_request(&self) -> std::result::Result<Request, WsError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| WsError::Connection(Arc::new(e)))?;
        if !self.protocols.is_empty() {
            let protocols = HeaderValue::from_str(&self.protocols.join(", ")).map_err(|e| {
                WsError::Connection(Arc::new(tungstenite::Error::HttpFormat(e.into())))
            })?;
            request
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, protocols);
        }
        Ok(request)
    }
}
