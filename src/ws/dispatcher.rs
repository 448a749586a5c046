//! Fan-out of lifecycle events and inbound messages to registered handlers.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;

use super::error::WsError;
use super::state::{ConnectionState, DisconnectReason};
use super::types::response::InboundMessage;
use crate::error::Kind;

/// Names of the events handlers can register for.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum EventKind {
    StateChange,
    Message,
    Error,
    Connected,
    Disconnected,
    Reconnecting,
}

/// An event delivered to handlers registered with [`Manager::on`](super::Manager::on).
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Event {
    StateChange {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// A data frame (control frames are not forwarded)
    Message(InboundMessage),
    Error(ErrorEvent),
    Connected,
    Disconnected {
        reason: DisconnectReason,
    },
    /// A retry has been scheduled
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
}

impl Event {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::StateChange { .. } => EventKind::StateChange,
            Self::Message(_) => EventKind::Message,
            Self::Error(_) => EventKind::Error,
            Self::Connected => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::Reconnecting { .. } => EventKind::Reconnecting,
        }
    }
}

/// Error surfaced on an open connection.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub kind: Kind,
    pub message: String,
}

impl ErrorEvent {
    #[must_use]
    pub fn new<S: Into<String>>(kind: Kind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&WsError> for ErrorEvent {
    fn from(error: &WsError) -> Self {
        Self::new(error.kind(), error.to_string())
    }
}

/// Identifies a registered handler so it can be removed with `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;
type MessageHandler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Handler registry shared by the manager and its connection task.
///
/// Handlers run synchronously on the connection task, in registration order. The handler
/// list is copied before dispatch, so a handler registered from inside another handler
/// first sees the next event.
pub(crate) struct Dispatcher {
    next_id: AtomicU64,
    events: DashMap<EventKind, Vec<(HandlerId, EventHandler)>>,
    by_type: DashMap<String, Vec<(HandlerId, MessageHandler)>>,
    by_channel: DashMap<String, Vec<(HandlerId, MessageHandler)>>,
    stream_tx: Mutex<Option<broadcast::Sender<InboundMessage>>>,
}

impl Dispatcher {
    pub(crate) fn new(capacity: usize) -> Self {
        let (stream_tx, _) = broadcast::channel(capacity);
        Self {
            next_id: AtomicU64::new(0),
            events: DashMap::new(),
            by_type: DashMap::new(),
            by_channel: DashMap::new(),
            stream_tx: Mutex::new(Some(stream_tx)),
        }
    }

    pub(crate) fn next_id(&self) -> HandlerId {
        HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn on(&self, kind: EventKind, handler: EventHandler) -> HandlerId {
        let id = self.next_id();
        self.events.entry(kind).or_default().push((id, handler));
        id
    }

    pub(crate) fn on_message_type(&self, msg_type: String, handler: MessageHandler) -> HandlerId {
        let id = self.next_id();
        self.by_type.entry(msg_type).or_default().push((id, handler));
        id
    }

    pub(crate) fn on_channel(&self, channel: String, handler: MessageHandler) -> HandlerId {
        let id = self.next_id();
        self.by_channel.entry(channel).or_default().push((id, handler));
        id
    }

    /// Removes the handler; `false` if it was not registered.
    pub(crate) fn off(&self, id: HandlerId) -> bool {
        remove_handler(&self.events, id)
            | remove_handler(&self.by_type, id)
            | remove_handler(&self.by_channel, id)
    }

    pub(crate) fn emit(&self, event: &Event) {
        let kind = event.kind();
        for handler in snapshot(&self.events, &kind) {
            isolate(kind, || handler(event));
        }
    }

    /// Delivers a data frame to generic, type and channel handlers, then to streams.
    pub(crate) fn dispatch_message(&self, message: InboundMessage) {
        self.emit(&Event::Message(message.clone()));

        for handler in snapshot(&self.by_type, message.msg_type.as_str()) {
            isolate(EventKind::Message, || handler(&message));
        }
        if let Some(channel) = message.channel.as_deref() {
            for handler in snapshot(&self.by_channel, channel) {
                isolate(EventKind::Message, || handler(&message));
            }
        }

        let stream_tx = self
            .stream_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = stream_tx.as_ref() {
            // No receivers is not an error
            _ = tx.send(message);
        }
    }

    /// New stream receiver, or `None` once the dispatcher was cleared.
    pub(crate) fn receiver(&self) -> Option<broadcast::Receiver<InboundMessage>> {
        self.stream_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(broadcast::Sender::subscribe)
    }

    /// Drops every handler and ends all streams.
    pub(crate) fn clear(&self) {
        self.events.clear();
        self.by_type.clear();
        self.by_channel.clear();
        self.stream_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

fn snapshot<K, Q, H>(map: &DashMap<K, Vec<(HandlerId, H)>>, key: &Q) -> Vec<H>
where
    K: Eq + std::hash::Hash + std::borrow::Borrow<Q>,
    Q: Eq + std::hash::Hash + ?Sized,
    H: Clone,
{
    map.get(key)
        .map(|entry| entry.iter().map(|(_, handler)| handler.clone()).collect())
        .unwrap_or_default()
}

fn remove_handler<K, H>(map: &DashMap<K, Vec<(HandlerId, H)>>, id: HandlerId) -> bool
where
    K: Eq + std::hash::Hash,
{
    let mut removed = false;
    for mut entry in map.iter_mut() {
        let before = entry.len();
        entry.retain(|(handler_id, _)| *handler_id != id);
        removed |= entry.len() != before;
    }
    removed
}

/// Runs one handler; a panic is logged and does not reach sibling handlers or the caller.
fn isolate<F: FnOnce()>(kind: EventKind, handler: F) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(handler)) {
        let message = panic_message(payload.as_ref());
        #[cfg(feature = "tracing")]
        tracing::error!(event = %kind, panic = %message, "Event handler panicked");
        #[cfg(not(feature = "tracing"))]
        let _ = (kind, &message);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload.downcast_ref::<&str>().map_or_else(
        || {
            payload
                .downcast_ref::<String>()
                .map_or_else(|| "unknown panic".to_owned(), Clone::clone)
        },
        |message| (*message).to_owned(),
    )
}
