//! Reconnecting, multiplexed WebSocket transport for market data.
//!
//! One [`Manager`] owns one connection and fans its frames out to any number of consumers.
//! Subscriptions and queued messages are kept across reconnects, so callers never have to
//! resubscribe by hand.
//!
//! # Architecture
//!
//! - [`Manager`]: public facade, cheap to clone
//! - `connection`: single task owning the socket, heartbeat and retry timer
//! - [`ConnectionState`] / [`DisconnectReason`]: lifecycle and its transition table
//! - [`LinearBackoff`]: reconnect schedule (`reconnect_interval × attempt`)
//! - [`SubscriptionRequest`]: logical subscription with a canonical key
//! - [`Event`] / [`EventKind`]: what handlers registered with [`Manager::on`] receive
//! - [`MessageParser`]: trait for turning raw frames into [`InboundMessage`]s
//!
//! # Ordering
//!
//! Messages sent while connected go out in call order. On every (re)connect the registered
//! subscriptions are replayed first, then messages queued while offline are flushed in
//! order, then anything sent afterwards.

pub mod config;
pub(crate) mod connection;
pub mod dispatcher;
pub mod error;
pub(crate) mod heartbeat;
pub mod manager;
pub(crate) mod queue;
pub mod reconnect;
pub mod state;
pub(crate) mod subscription;
pub mod traits;
pub mod types;

pub use config::Config;
pub use dispatcher::{ErrorEvent, Event, EventKind, HandlerId};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use manager::Manager;
pub use reconnect::{LinearBackoff, ReconnectDecision};
pub use state::{ConnectionState, DisconnectReason};
pub use traits::*;
pub use types::request::{OutboundMessage, SubscriptionRequest};
pub use types::response::{InboundKind, InboundMessage, parse_messages};
