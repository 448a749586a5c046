use std::future::pending;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Sleep, sleep, timeout};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::config::Config;
use super::dispatcher::{Dispatcher, ErrorEvent, Event};
use super::error::WsError;
use super::heartbeat::{Beat, Heartbeat};
use super::queue::OutboundQueue;
use super::reconnect::{ReconnectController, ReconnectDecision};
use super::state::{ConnectionState, DisconnectReason};
use super::subscription::SubscriptionRegistry;
use super::traits::MessageParser;
use super::types::request::{OutboundMessage, SubscriptionRequest};
use super::types::response::{InboundKind, InboundMessage};
use crate::Result;
use crate::error::Kind;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectFuture = BoxFuture<'static, std::result::Result<WsStream, WsError>>;
type ConnectReply = oneshot::Sender<Result<()>>;

/// Close code reported when the peer's close frame carried none.
const NO_STATUS_RECEIVED: u16 = 1005;
/// Close code reported when the stream ended without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

/// Requests from the [`Manager`](super::Manager) to its connection task.
#[derive(Debug)]
pub(crate) enum Command {
    Connect { reply: Option<ConnectReply> },
    Disconnect,
    Send(OutboundMessage),
    Subscribe { request: SubscriptionRequest, seq: u64 },
    Unsubscribe { request: SubscriptionRequest, seq: u64 },
    Destroy,
}

/// State shared between the manager handles and the connection task.
pub(crate) struct Shared {
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) dispatcher: Dispatcher,
}

/// Owns the transport and everything tied to one connection session.
///
/// All mutation happens on this single task: commands, inbound frames, the connect attempt,
/// heartbeat ticks and the retry timer are multiplexed in one `select!` loop, so no two
/// sockets can ever be live at once.
pub(crate) struct ConnectionActor<P> {
    config: Config,
    parser: P,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    socket: Option<WsStream>,
    connecting: Option<ConnectFuture>,
    waiters: Vec<ConnectReply>,
    heartbeat: Option<Heartbeat>,
    retry: Option<Pin<Box<Sleep>>>,
    reconnect: ReconnectController,
    queue: OutboundQueue,
    /// Registry mutations below this were covered by the last replay
    replay_watermark: u64,
}

impl<P: MessageParser> ConnectionActor<P> {
    pub(crate) fn new(
        config: Config,
        parser: P,
        shared: Arc<Shared>,
        commands: mpsc::UnboundedReceiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        let reconnect = ReconnectController::new(config.backoff(), config.enable_reconnect);
        Self {
            config,
            parser,
            shared,
            commands,
            state_tx,
            socket: None,
            connecting: None,
            waiters: Vec::new(),
            heartbeat: None,
            retry: None,
            reconnect,
            queue: OutboundQueue::default(),
            replay_watermark: 0,
        }
    }

    /// Runs until destroyed or until every manager handle is dropped.
    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    if self.handle_command(command).await.is_break() {
                        break;
                    }
                }
                result = in_flight(&mut self.connecting) => match result {
                    Ok(socket) => self.on_open(socket).await,
                    Err(e) => self.on_connect_failed(e),
                },
                frame = next_frame(&mut self.socket) => self.on_frame(frame).await,
                beat = next_beat(&mut self.heartbeat) => self.on_heartbeat(beat).await,
                () = retry_due(&mut self.retry) => {
                    self.retry = None;
                    self.start_connect();
                }
            }
        }

        self.shutdown().await;
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Connect { reply } => self.request_connect(reply),
            Command::Disconnect => self.disconnect().await,
            Command::Send(message) => self.send(message).await,
            Command::Subscribe { request, seq } => {
                if self.is_live(seq) {
                    self.transmit(OutboundMessage::subscribe(&request)).await;
                }
            }
            Command::Unsubscribe { request, seq } => {
                if self.is_live(seq) {
                    self.transmit(OutboundMessage::unsubscribe(&request)).await;
                }
            }
            Command::Destroy => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn emit(&self, event: &Event) {
        self.shared.dispatcher.emit(event);
    }

    /// Moves to `to` if the transition table allows it.
    fn transition(&self, to: ConnectionState) -> bool {
        let from = self.state();
        if !from.can_transition_to(to) {
            #[cfg(feature = "tracing")]
            tracing::error!(%from, %to, "Rejected illegal connection state transition");
            return false;
        }

        self.state_tx.send_replace(to);
        #[cfg(feature = "tracing")]
        tracing::debug!(%from, %to, "Connection state changed");
        self.emit(&Event::StateChange { from, to });
        true
    }

    /// Whether a live subscribe/unsubscribe command still has to reach the wire.
    fn is_live(&self, seq: u64) -> bool {
        self.socket.is_some() && seq >= self.replay_watermark
    }

    fn resolve_waiters(&mut self, result: &std::result::Result<(), WsError>) {
        for waiter in self.waiters.drain(..) {
            _ = waiter.send(result.clone().map_err(Into::into));
        }
    }

    fn request_connect(&mut self, reply: Option<ConnectReply>) {
        match self.state() {
            ConnectionState::Connected => {
                if let Some(reply) = reply {
                    _ = reply.send(Ok(()));
                }
            }
            ConnectionState::Connecting => self.waiters.extend(reply),
            _ => {
                self.waiters.extend(reply);
                // An explicit connect while a retry is pending fires that retry now and keeps
                // the attempt count; otherwise it starts a fresh schedule.
                if self.retry.take().is_none() {
                    self.reconnect.reset();
                }
                self.start_connect();
            }
        }
    }

    fn start_connect(&mut self) {
        if self.socket.is_some() || self.connecting.is_some() {
            return;
        }

        if !self.transition(ConnectionState::Connecting) {
            return;
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(url = %self.config.url, "Connecting to WebSocket");

        let request = self.config.client_request();
        let deadline = self.config.connect_timeout;
        self.connecting = Some(Box::pin(async move {
            match timeout(deadline, connect_async(request?)).await {
                Ok(Ok((socket, _response))) => Ok(socket),
                Ok(Err(e)) => Err(WsError::Connection(Arc::new(e))),
                Err(_elapsed) => Err(WsError::ConnectTimeout(deadline)),
            }
        }));
    }

    async fn on_open(&mut self, socket: WsStream) {
        self.socket = Some(socket);
        self.reconnect.reset();
        self.transition(ConnectionState::Connected);
        if self.config.enable_heartbeat {
            self.heartbeat = Some(Heartbeat::start(
                self.config.heartbeat_interval,
                self.config.effective_heartbeat_timeout(),
            ));
        }
        self.resolve_waiters(&Ok(()));
        self.emit(&Event::Connected);

        // Subscriptions are reasserted before any queued application traffic
        let (watermark, replay) = self.shared.registry.snapshot();
        self.replay_watermark = watermark;
        #[cfg(feature = "tracing")]
        tracing::debug!(
            subscriptions = replay.len(),
            queued = self.queue.len(),
            "Connected, replaying subscriptions and flushing queue"
        );
        for request in replay {
            if !self.transmit(OutboundMessage::subscribe(&request)).await {
                return;
            }
        }
        while let Some(message) = self.queue.pop_front() {
            if !self.transmit(message).await {
                return;
            }
        }
    }

    fn on_connect_failed(&mut self, error: WsError) {
        #[cfg(feature = "tracing")]
        tracing::warn!(error = %error, "Unable to connect");

        self.transition(ConnectionState::Error);
        self.emit(&Event::Error(ErrorEvent::from(&error)));
        self.transition(ConnectionState::Disconnected);
        self.resolve_waiters(&Err(error));
        self.schedule_reconnect();
    }

    /// Tears down an unexpectedly lost session; the registry and queue are kept.
    fn on_connection_lost(&mut self, reason: DisconnectReason) {
        if self.socket.take().is_none() {
            return;
        }
        self.heartbeat = None;

        #[cfg(feature = "tracing")]
        tracing::debug!(?reason, "WebSocket connection lost");
        self.transition(ConnectionState::Disconnected);
        let manual = reason.is_manual();
        self.emit(&Event::Disconnected { reason });
        if !manual {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        match self.reconnect.next_attempt() {
            None => {}
            Some(ReconnectDecision::Retry {
                attempt,
                max_attempts,
                delay,
            }) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(attempt, max_attempts, ?delay, "Scheduling reconnect");
                self.retry = Some(Box::pin(sleep(delay)));
                self.emit(&Event::Reconnecting {
                    attempt,
                    max_attempts,
                    delay,
                });
            }
            Some(ReconnectDecision::Exhausted { attempts }) => {
                let error = WsError::ReconnectExhausted { attempts };
                #[cfg(feature = "tracing")]
                tracing::error!(error = %error, "Giving up on reconnection");
                self.emit(&Event::Error(ErrorEvent::from(&error)));
            }
        }
    }

    async fn on_frame(
        &mut self,
        frame: Option<std::result::Result<Message, tungstenite::Error>>,
    ) {
        match frame {
            Some(Ok(Message::Text(text))) => self.on_payload(text.as_bytes()),
            Some(Ok(Message::Binary(bytes))) => self.on_payload(&bytes),
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = frame.map_or_else(
                    || (NO_STATUS_RECEIVED, String::new()),
                    |frame| (u16::from(frame.code), frame.reason.as_str().to_owned()),
                );
                // Flush the close reply tungstenite queued
                if let Some(socket) = self.socket.as_mut() {
                    close_socket(socket, self.config.disconnect_timeout).await;
                }
                self.on_connection_lost(DisconnectReason::Closed { code, reason });
            }
            Some(Ok(_)) => self.touch(),
            Some(Err(e)) => {
                self.on_connection_lost(DisconnectReason::TransportError(e.to_string()));
            }
            None => self.on_connection_lost(DisconnectReason::Closed {
                code: ABNORMAL_CLOSURE,
                reason: String::new(),
            }),
        }
    }

    fn touch(&mut self) {
        if let Some(heartbeat) = self.heartbeat.as_mut() {
            heartbeat.record_activity();
        }
    }

    fn on_payload(&mut self, bytes: &[u8]) {
        self.touch();
        match self.parser.parse(bytes) {
            Ok(messages) => {
                for message in messages {
                    self.route(message);
                }
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    frame = %String::from_utf8_lossy(bytes),
                    error = %e,
                    "Dropping unparsable WebSocket frame"
                );
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }
    }

    fn route(&self, message: InboundMessage) {
        match message.kind() {
            InboundKind::Pong => {
                #[cfg(feature = "tracing")]
                tracing::trace!("Received pong");
            }
            InboundKind::SubscriptionSuccess | InboundKind::UnsubscriptionSuccess => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    msg_type = %message.msg_type,
                    id = ?message.id,
                    "Subscription acknowledged"
                );
            }
            InboundKind::Error => {
                let error = ErrorEvent::new(Kind::Server, message.error_message());
                #[cfg(feature = "tracing")]
                tracing::warn!(message = %error.message, "Server reported an error");
                self.emit(&Event::Error(error));
            }
            InboundKind::Data => self.shared.dispatcher.dispatch_message(message),
        }
    }

    async fn on_heartbeat(&mut self, beat: Beat) {
        match beat {
            Beat::Ping => {
                self.transmit(OutboundMessage::ping()).await;
            }
            Beat::Expired(after) => {
                let error = WsError::HeartbeatTimeout(after);
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %error, "Heartbeat timeout, closing connection");
                self.emit(&Event::Error(ErrorEvent::from(&error)));
                self.on_connection_lost(DisconnectReason::HeartbeatTimeout);
            }
        }
    }

    /// Writes one message; returns whether the connection is still usable.
    ///
    /// Delivery is at most once: a message whose write fails is not retried.
    async fn transmit(&mut self, message: OutboundMessage) -> bool {
        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %e, "Failed to encode outbound message");
                self.emit(&Event::Error(ErrorEvent::new(e.kind(), e.to_string())));
                return true;
            }
        };
        let Some(socket) = self.socket.as_mut() else {
            return false;
        };

        #[cfg(feature = "tracing")]
        tracing::trace!(%frame, "Sending WebSocket frame");
        match socket.send(Message::Text(frame.into())).await {
            Ok(()) => true,
            Err(e) => {
                let error = WsError::Connection(Arc::new(e));
                #[cfg(feature = "tracing")]
                tracing::error!(error = %error, "Failed to send WebSocket frame");
                self.emit(&Event::Error(ErrorEvent::from(&error)));
                self.on_connection_lost(DisconnectReason::TransportError(error.to_string()));
                false
            }
        }
    }

    async fn send(&mut self, message: OutboundMessage) {
        if self.socket.is_some() {
            self.transmit(message).await;
            return;
        }

        self.queue.push(message);
        if self.state() == ConnectionState::Disconnected && self.retry.is_none() {
            self.request_connect(None);
        }
    }

    /// Manual, authoritative teardown: no retry survives it.
    async fn disconnect(&mut self) {
        self.retry = None;
        self.reconnect.reset();
        if !matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return;
        }

        self.transition(ConnectionState::Disconnecting);
        self.heartbeat = None;
        self.connecting = None;
        self.resolve_waiters(&Err(WsError::Aborted));
        if let Some(mut socket) = self.socket.take() {
            close_socket(&mut socket, self.config.disconnect_timeout).await;
        }

        self.transition(ConnectionState::Disconnected);
        self.emit(&Event::Disconnected {
            reason: DisconnectReason::Manual,
        });
    }

    async fn shutdown(&mut self) {
        self.resolve_waiters(&Err(WsError::Destroyed));
        self.disconnect().await;
        self.queue.clear();
        self.shared.registry.clear();
        self.shared.dispatcher.clear();
        #[cfg(feature = "tracing")]
        tracing::debug!("Connection task stopped");
    }
}

/// Runs the close handshake, giving up after `deadline`.
async fn close_socket(socket: &mut WsStream, deadline: Duration) {
    match timeout(deadline, socket.close(None)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            #[cfg(feature = "tracing")]
            tracing::debug!(error = %e, "Close handshake failed");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
        Err(_elapsed) => {
            #[cfg(feature = "tracing")]
            tracing::debug!("Close handshake timed out");
        }
    }
}

async fn in_flight(connecting: &mut Option<ConnectFuture>) -> std::result::Result<WsStream, WsError> {
    let Some(attempt) = connecting.as_mut() else {
        return pending().await;
    };
    let result = attempt.await;
    *connecting = None;
    result
}

async fn next_frame(
    socket: &mut Option<WsStream>,
) -> Option<std::result::Result<Message, tungstenite::Error>> {
    match socket.as_mut() {
        Some(socket) => socket.next().await,
        None => pending().await,
    }
}

async fn next_beat(heartbeat: &mut Option<Heartbeat>) -> Beat {
    match heartbeat.as_mut() {
        Some(heartbeat) => heartbeat.tick().await,
        None => pending().await,
    }
}

async fn retry_due(retry: &mut Option<Pin<Box<Sleep>>>) {
    match retry.as_mut() {
        Some(timer) => timer.await,
        None => pending().await,
    }
}
