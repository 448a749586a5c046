use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_stream::stream;
use futures::Stream;
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot, watch};

use super::config::Config;
use super::connection::{Command, ConnectionActor, Shared};
use super::dispatcher::{Dispatcher, Event, EventKind, HandlerId};
use super::error::WsError;
use super::state::ConnectionState;
use super::subscription::SubscriptionRegistry;
use super::traits::{JsonParser, MessageParser};
use super::types::request::{OutboundMessage, SubscriptionRequest};
use super::types::response::InboundMessage;
use crate::Result;
use crate::error::{Error, Kind};

/// Entry point of the market-data stream: one connection, many consumers.
///
/// Cheap to clone; every clone drives the same connection. The connection task stops when
/// [`destroy`](Self::destroy) is called or when the last clone is dropped.
///
/// # Examples
///
/// ```rust, no_run
/// use market_stream_client::ws::{Config, Manager, SubscriptionRequest};
/// use futures::StreamExt as _;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let manager = Manager::new(Config::new("wss://stream.example.com/ws"))?;
///
///     manager.on_channel("market_data_AAPL", |message| {
///         println!("AAPL: {}", message.data);
///     });
///     manager.connect().await?;
///     manager.subscribe(SubscriptionRequest::new(["AAPL"], ["quote"]))?;
///
///     let mut stream = Box::pin(manager.stream());
///     while let Some(message) = stream.next().await {
///         println!("{:?}", message?);
///     }
///
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: Config,
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    shared: Arc<Shared>,
    destroyed: AtomicBool,
}

impl Manager {
    /// Create a manager for JSON envelopes and start its connection task.
    ///
    /// Nothing is dialed until [`connect`](Self::connect) or a queued [`send`](Self::send).
    /// Must be called from within a tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_parser(config, JsonParser)
    }

    /// Like [`new`](Self::new), with a custom frame parser.
    pub fn with_parser<P: MessageParser>(config: Config, parser: P) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| Error::with_source(Kind::Internal, e))?;

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            registry: SubscriptionRegistry::default(),
            dispatcher: Dispatcher::new(config.broadcast_capacity),
        });

        let actor = ConnectionActor::new(
            config.clone(),
            parser,
            Arc::clone(&shared),
            commands_rx,
            state_tx,
        );
        runtime.spawn(actor.run());

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                commands,
                state_rx,
                shared,
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    fn command(&self, command: Command) -> Result<()> {
        if self.is_destroyed() {
            return Err(WsError::Destroyed.into());
        }
        self.inner
            .commands
            .send(command)
            .map_err(|_e| WsError::Destroyed.into())
    }

    /// Open the connection, resolving once it is usable.
    ///
    /// Joins an attempt already in flight and returns immediately when already connected.
    /// Fails with a `Timeout` error after `connect_timeout`, with a `Transport` error if the
    /// handshake fails, or with `Destroyed` once the manager is torn down.
    pub async fn connect(&self) -> Result<()> {
        let (reply, outcome) = oneshot::channel();
        self.command(Command::Connect { reply: Some(reply) })?;
        outcome.await.map_err(|_e| Error::from(WsError::Destroyed))?
    }

    /// Close the connection and cancel any pending reconnect. Idempotent.
    pub fn disconnect(&self) {
        _ = self.command(Command::Disconnect);
    }

    /// Send now if connected; otherwise queue and, when idle, start connecting.
    pub fn send(&self, message: OutboundMessage) -> Result<()> {
        self.command(Command::Send(message))
    }

    /// Register (or replace) a subscription.
    ///
    /// Sent immediately when connected and replayed after every reconnect until
    /// [`unsubscribe`](Self::unsubscribe)d.
    pub fn subscribe(&self, request: SubscriptionRequest) -> Result<()> {
        if self.is_destroyed() {
            return Err(WsError::Destroyed.into());
        }
        request.validate()?;

        #[cfg(feature = "tracing")]
        tracing::debug!(key = %request.key(), "Subscribing");
        self.inner.shared.registry.upsert(request, |seq, request| {
            self.command(Command::Subscribe {
                request: request.clone(),
                seq,
            })
        })
    }

    /// Drop a subscription. Nothing is sent unless connected.
    pub fn unsubscribe(&self, request: &SubscriptionRequest) -> Result<()> {
        if self.is_destroyed() {
            return Err(WsError::Destroyed.into());
        }
        self.unsubscribe_key(&request.key())
    }

    fn unsubscribe_key(&self, key: &str) -> Result<()> {
        #[cfg(feature = "tracing")]
        tracing::debug!(%key, "Unsubscribing");
        self.inner
            .shared
            .registry
            .remove(key, |seq, request| {
                self.command(Command::Unsubscribe {
                    request: request.clone(),
                    seq,
                })
            })
            .unwrap_or(Ok(()))
    }

    /// Current subscriptions, least recently changed first.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<SubscriptionRequest> {
        self.inner.shared.registry.list()
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.shared.registry.len()
    }

    /// Unsubscribe everything.
    pub fn clear_subscriptions(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(WsError::Destroyed.into());
        }
        for key in self.inner.shared.registry.keys() {
            self.unsubscribe_key(&key)?;
        }
        Ok(())
    }

    /// Register a handler for one kind of event.
    ///
    /// Handlers run on the connection task and must not block. A panicking handler is
    /// logged and skipped. A handler that captures this manager keeps it alive until
    /// [`destroy`](Self::destroy) is called.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let dispatcher = &self.inner.shared.dispatcher;
        if self.is_destroyed() {
            return dispatcher.next_id();
        }
        dispatcher.on(kind, Arc::new(handler))
    }

    /// Register a handler for data frames with the given `type`.
    pub fn on_message_type<F>(&self, msg_type: &str, handler: F) -> HandlerId
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let dispatcher = &self.inner.shared.dispatcher;
        if self.is_destroyed() {
            return dispatcher.next_id();
        }
        dispatcher.on_message_type(msg_type.to_owned(), Arc::new(handler))
    }

    /// Register a handler for data frames tagged with `channel`.
    pub fn on_channel<F>(&self, channel: &str, handler: F) -> HandlerId
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let dispatcher = &self.inner.shared.dispatcher;
        if self.is_destroyed() {
            return dispatcher.next_id();
        }
        dispatcher.on_channel(channel.to_owned(), Arc::new(handler))
    }

    /// Remove a handler; `false` if it was not registered.
    pub fn off(&self, id: HandlerId) -> bool {
        self.inner.shared.dispatcher.off(id)
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Every data frame from now on, as a stream.
    ///
    /// A consumer that falls more than `broadcast_capacity` messages behind receives one
    /// `Lagged` error item and then continues with the oldest messages still buffered. The
    /// stream ends when the manager is destroyed.
    pub fn stream(&self) -> impl Stream<Item = Result<InboundMessage>> + use<> {
        self.filtered_stream(None)
    }

    /// Data frames tagged with `channel`, as a stream.
    pub fn channel_stream(&self, channel: &str) -> impl Stream<Item = Result<InboundMessage>> + use<> {
        self.filtered_stream(Some(channel.to_owned()))
    }

    fn filtered_stream(
        &self,
        channel: Option<String>,
    ) -> impl Stream<Item = Result<InboundMessage>> + use<> {
        let receiver = self.inner.shared.dispatcher.receiver();

        stream! {
            if let Some(mut rx) = receiver {
                loop {
                    match rx.recv().await {
                        Ok(message) => {
                            if channel.is_none() || message.channel == channel {
                                yield Ok(message);
                            }
                        }
                        Err(RecvError::Lagged(count)) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!("Message stream lagged, missed {count} messages");
                            let lagged: Error = WsError::Lagged { count }.into();
                            yield Err(lagged);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }
    }

    /// Tear down for good: cancels timers, closes the socket and drops all handlers,
    /// queued messages and subscriptions. Later calls are inert.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        #[cfg(feature = "tracing")]
        tracing::debug!("Destroying manager");
        self.inner.shared.dispatcher.clear();
        self.inner.shared.registry.clear();
        _ = self.inner.commands.send(Command::Destroy);
    }

    /// Whether [`destroy`](Self::destroy) has been called on any clone.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// The configuration this manager was built with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .field("subscriptions", &self.subscription_count())
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}
