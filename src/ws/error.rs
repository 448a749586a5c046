#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Kind;

/// WebSocket error variants.
///
/// Sources are reference counted so that one failed connect attempt can reject every
/// caller waiting on it.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum WsError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(Arc<tokio_tungstenite::tungstenite::Error>),
    /// Error parsing a WebSocket message
    MessageParse(Arc<serde_json::Error>),
    /// Connect attempt did not complete within the configured timeout
    ConnectTimeout(Duration),
    /// No frame arrived from the server within the heartbeat timeout
    HeartbeatTimeout(Duration),
    /// Connect attempt was abandoned because of a manual disconnect
    Aborted,
    /// The server answered with an `error` frame
    Server(String),
    /// Automatic reconnection gave up
    ReconnectExhausted {
        /// Number of attempts that were made
        attempts: u32,
    },
    /// The manager was destroyed
    Destroyed,
    /// Stream consumer lagged and missed messages
    Lagged {
        /// Number of messages that were missed
        count: u64,
    },
}

impl WsError {
    /// The crate-level [`Kind`] this error is reported as.
    #[must_use]
    pub const fn kind(&self) -> Kind {
        match self {
            Self::Connection(_) | Self::Aborted => Kind::Transport,
            Self::MessageParse(_) => Kind::Protocol,
            Self::ConnectTimeout(_) | Self::HeartbeatTimeout(_) => Kind::Timeout,
            Self::Server(_) => Kind::Server,
            Self::ReconnectExhausted { .. } => Kind::ReconnectExhausted,
            Self::Destroyed => Kind::Destroyed,
            Self::Lagged { .. } => Kind::Internal,
        }
    }
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::MessageParse(e) => write!(f, "Failed to parse WebSocket message: {e}"),
            Self::ConnectTimeout(d) => write!(f, "WebSocket connect timed out after {d:?}"),
            Self::HeartbeatTimeout(d) => {
                write!(f, "No frame received from server within {d:?}")
            }
            Self::Aborted => write!(f, "Connect attempt aborted by disconnect"),
            Self::Server(message) => write!(f, "Server error: {message}"),
            Self::ReconnectExhausted { attempts } => {
                write!(f, "Reconnection failed after {attempts} attempts")
            }
            Self::Destroyed => write!(f, "Manager has been destroyed"),
            Self::Lagged { count } => write!(f, "Stream lagged, missed {count} messages"),
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e.as_ref()),
            Self::MessageParse(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<WsError> for crate::error::Error {
    fn from(e: WsError) -> Self {
        crate::error::Error::with_source(e.kind(), e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for crate::error::Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        WsError::Connection(Arc::new(e)).into()
    }
}
