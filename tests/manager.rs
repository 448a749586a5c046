#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use market_stream_client::error::Kind;
use market_stream_client::ws::{
    Config, ConnectionState, DisconnectReason, ErrorEvent, Event, EventKind, Manager,
    OutboundMessage, SubscriptionRequest, WsError,
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone)]
enum ServerCommand {
    Text(String),
    Close,
}

/// Mock WebSocket server.
struct MockWsServer {
    addr: SocketAddr,
    /// Commands for ALL connected clients
    command_tx: broadcast::Sender<ServerCommand>,
    /// Text frames received from clients, parsed as JSON
    frame_rx: mpsc::UnboundedReceiver<Value>,
    /// TCP connections accepted so far
    connections: Arc<AtomicUsize>,
    /// Close frames clients sent back after a server-initiated close
    close_replies: Arc<AtomicUsize>,
}

impl MockWsServer {
    async fn start() -> Self {
        Self::start_with(false).await
    }

    /// A server that answers every `ping` with a `pong`.
    async fn answering_pings() -> Self {
        Self::start_with(true).await
    }

    async fn start_with(reply_pong: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (command_tx, _) = broadcast::channel::<ServerCommand>(100);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Value>();
        let connections = Arc::new(AtomicUsize::new(0));
        let close_replies = Arc::new(AtomicUsize::new(0));

        let broadcast_tx = command_tx.clone();
        let accepted = Arc::clone(&connections);
        let replies = Arc::clone(&close_replies);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                accepted.fetch_add(1, Ordering::SeqCst);

                // Subscribe before the handshake so nothing sent once connect() resolves is lost
                let mut command_rx = broadcast_tx.subscribe();
                let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };

                let (mut write, mut read) = ws_stream.split();
                let frame_tx = frame_tx.clone();
                let replies = Arc::clone(&replies);

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        let value: Value = serde_json::from_str(&text).unwrap();
                                        if reply_pong && value["type"] == "ping" {
                                            let pong = json!({ "type": "pong", "data": {} });
                                            if write
                                                .send(Message::Text(pong.to_string().into()))
                                                .await
                                                .is_err()
                                            {
                                                break;
                                            }
                                        }
                                        drop(frame_tx.send(value));
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            command = command_rx.recv() => {
                                match command {
                                    Ok(ServerCommand::Text(text)) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Ok(ServerCommand::Close) | Err(_) => {
                                        drop(write.send(Message::Close(None)).await);
                                        let reply = timeout(Duration::from_secs(1), async {
                                            while let Some(Ok(msg)) = read.next().await {
                                                if msg.is_close() {
                                                    return true;
                                                }
                                            }
                                            false
                                        });
                                        if matches!(reply.await, Ok(true)) {
                                            replies.fetch_add(1, Ordering::SeqCst);
                                        }
                                        break;
                                    }
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            command_tx,
            frame_rx,
            connections,
            close_replies,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Send a JSON frame to all connected clients.
    fn send(&self, frame: &Value) {
        self.send_raw(&frame.to_string());
    }

    fn send_raw(&self, text: &str) {
        drop(self.command_tx.send(ServerCommand::Text(text.to_owned())));
    }

    /// Close every open connection from the server side.
    fn close_all(&self) {
        drop(self.command_tx.send(ServerCommand::Close));
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn close_replies(&self) -> usize {
        self.close_replies.load(Ordering::SeqCst)
    }

    /// Receive the next frame sent by a client.
    async fn recv_frame(&mut self) -> Option<Value> {
        timeout(Duration::from_secs(2), self.frame_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Receive frames up to and including the first one of `msg_type`.
    async fn recv_until(&mut self, msg_type: &str) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Some(frame) = self.recv_frame().await {
            let done = frame["type"] == msg_type;
            frames.push(frame);
            if done {
                return frames;
            }
        }
        panic!("no {msg_type} frame received, got {frames:?}");
    }
}

fn config(url: &str) -> Config {
    Config::builder()
        .url(url)
        .enable_heartbeat(false)
        .reconnect_interval(Duration::from_millis(50))
        .connect_timeout(Duration::from_secs(2))
        .build()
}

/// Forward every event of `kind` into a channel.
fn events(manager: &Manager, kind: EventKind) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    manager.on(kind, move |event| drop(tx.send(event.clone())));
    rx
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap()
}

fn marker(label: &str) -> OutboundMessage {
    OutboundMessage::new("marker", json!({ "label": label }))
}

fn aapl_ticks() -> SubscriptionRequest {
    SubscriptionRequest::new(["AAPL"], ["tick"])
}

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn connect_times_out_when_handshake_never_completes() {
        // Accepts TCP but never answers the upgrade request
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let mut config = config(&url);
        config.connect_timeout = Duration::from_millis(200);
        config.enable_reconnect = false;
        let manager = Manager::new(config).unwrap();

        let transitions = Arc::new(Mutex::new(Vec::new()));
        {
            let transitions = Arc::clone(&transitions);
            manager.on(EventKind::StateChange, move |event| {
                if let Event::StateChange { to, .. } = event {
                    transitions.lock().unwrap().push(*to);
                }
            });
        }

        let err = manager.connect().await.unwrap_err();

        assert_eq!(err.kind(), Kind::Timeout);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(
            *transitions.lock().unwrap(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Error,
                ConnectionState::Disconnected,
            ]
        );
        drop(listener);
    }

    #[tokio::test]
    async fn destroy_rejects_in_flight_connect_as_destroyed() {
        // Accepts TCP but never answers the upgrade request
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let manager = Manager::new(config(&url)).unwrap();

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect().await })
        };
        sleep(Duration::from_millis(100)).await;
        manager.destroy();

        let err = timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), Kind::Destroyed);
        drop(listener);
    }

    #[tokio::test]
    async fn answers_server_close_with_close_frame() {
        let server = MockWsServer::start().await;
        let mut config = config(&server.url());
        config.enable_reconnect = false;
        let manager = Manager::new(config).unwrap();
        let mut disconnected = events(&manager, EventKind::Disconnected);

        manager.connect().await.unwrap();
        server.close_all();

        let Event::Disconnected { reason } = next_event(&mut disconnected).await else {
            panic!("expected a disconnected event");
        };
        assert!(matches!(
            reason,
            DisconnectReason::Closed { code: 1005, .. }
        ));
        timeout(Duration::from_secs(2), async {
            while server.close_replies() == 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(server.close_replies(), 1);
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_connection() {
        let server = MockWsServer::start().await;
        let manager = Manager::new(config(&server.url())).unwrap();

        let (first, second) = tokio::join!(manager.connect(), manager.connect());
        first.unwrap();
        second.unwrap();
        manager.connect().await.unwrap();

        assert!(manager.is_connected());
        assert_eq!(server.connections(), 1);
    }

    #[tokio::test]
    async fn send_while_disconnected_connects_implicitly() {
        let mut server = MockWsServer::start().await;
        let manager = Manager::new(config(&server.url())).unwrap();
        let mut state_rx = manager.state_receiver();

        manager.send(marker("implicit")).unwrap();

        let frame = server.recv_frame().await.unwrap();
        assert_eq!(frame["data"]["label"], "implicit");
        timeout(
            Duration::from_secs(2),
            state_rx.wait_for(|state| state.is_connected()),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let server = MockWsServer::start().await;
        let manager = Manager::new(config(&server.url())).unwrap();
        let mut disconnected = events(&manager, EventKind::Disconnected);

        manager.connect().await.unwrap();
        manager.disconnect();
        manager.disconnect();

        let event = next_event(&mut disconnected).await;
        assert!(matches!(
            event,
            Event::Disconnected {
                reason: DisconnectReason::Manual
            }
        ));
        sleep(Duration::from_millis(200)).await;
        assert!(disconnected.try_recv().is_err(), "only one disconnect event");
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(server.connections(), 1, "manual disconnect never reconnects");
    }
}

mod reconnection {
    use super::*;

    #[tokio::test]
    async fn resubscribes_after_server_closes_connection() {
        let mut server = MockWsServer::start().await;
        let manager = Manager::new(config(&server.url())).unwrap();
        let mut reconnecting = events(&manager, EventKind::Reconnecting);

        manager.connect().await.unwrap();
        manager.subscribe(aapl_ticks()).unwrap();

        let first = server.recv_frame().await.unwrap();
        assert_eq!(first["type"], "subscribe");
        assert_eq!(first["data"]["symbols"], json!(["AAPL"]));

        server.close_all();

        let Event::Reconnecting { attempt, delay, .. } = next_event(&mut reconnecting).await else {
            panic!("expected a reconnecting event");
        };
        assert_eq!(attempt, 1);
        assert_eq!(delay, Duration::from_millis(50));

        let replayed = server.recv_frame().await.unwrap();
        assert_eq!(replayed["type"], "subscribe");
        assert_eq!(replayed["data"], first["data"]);
        assert_ne!(replayed["id"], first["id"], "replay is a fresh request");
        assert_eq!(server.connections(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        // Nothing listens on this port
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();

        let mut config = config(&format!("ws://{addr}"));
        config.reconnect_interval = Duration::from_millis(20);
        config.max_reconnect_attempts = 5;
        let manager = Manager::new(config).unwrap();

        let mut reconnecting = events(&manager, EventKind::Reconnecting);
        let (exhausted_tx, mut exhausted_rx) = mpsc::unbounded_channel();
        manager.on(EventKind::Error, move |event| {
            if let Event::Error(error) = event
                && error.kind == Kind::ReconnectExhausted
            {
                drop(exhausted_tx.send(error.clone()));
            }
        });

        let err = manager.connect().await.unwrap_err();
        assert_eq!(err.kind(), Kind::Transport);

        let exhausted = timeout(Duration::from_secs(5), exhausted_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(exhausted.message.contains("after 5 attempts"));

        let mut schedule = Vec::new();
        while let Ok(Event::Reconnecting { attempt, delay, .. }) = reconnecting.try_recv() {
            schedule.push((attempt, delay));
        }
        let expected: Vec<_> = (1..=5_u32)
            .map(|n| (n, Duration::from_millis(20) * n))
            .collect();
        assert_eq!(schedule, expected);

        sleep(Duration::from_millis(300)).await;
        assert!(reconnecting.try_recv().is_err(), "no sixth attempt");
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_retry() {
        let server = MockWsServer::start().await;
        let mut config = config(&server.url());
        config.reconnect_interval = Duration::from_millis(300);
        let manager = Manager::new(config).unwrap();
        let mut reconnecting = events(&manager, EventKind::Reconnecting);

        manager.connect().await.unwrap();
        server.close_all();
        next_event(&mut reconnecting).await;

        manager.disconnect();
        sleep(Duration::from_millis(700)).await;

        assert_eq!(server.connections(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn unsubscribed_while_disconnected_is_not_replayed() {
        let mut server = MockWsServer::start().await;
        let manager = Manager::new(config(&server.url())).unwrap();
        let msft = SubscriptionRequest::new(["MSFT"], ["tick"]);

        manager.connect().await.unwrap();
        manager.subscribe(aapl_ticks()).unwrap();
        manager.subscribe(msft.clone()).unwrap();
        manager.send(marker("first session")).unwrap();
        assert_eq!(server.recv_until("marker").await.len(), 3);

        manager.disconnect();
        let mut state_rx = manager.state_receiver();
        state_rx
            .wait_for(|state| *state == ConnectionState::Disconnected)
            .await
            .unwrap();
        manager.unsubscribe(&msft).unwrap();
        assert_eq!(manager.subscriptions(), vec![aapl_ticks()]);

        manager.connect().await.unwrap();
        manager.send(marker("second session")).unwrap();

        let frames = server.recv_until("marker").await;
        let subscribed: Vec<_> = frames
            .iter()
            .filter(|frame| frame["type"] == "subscribe")
            .map(|frame| frame["data"]["symbols"].clone())
            .collect();
        assert_eq!(subscribed, vec![json!(["AAPL"])]);
        assert!(
            frames.iter().all(|frame| frame["type"] != "unsubscribe"),
            "nothing to cancel server-side"
        );
    }
}

mod ordering {
    use super::*;

    #[tokio::test]
    async fn queued_messages_flush_before_later_sends() {
        let mut server = MockWsServer::start().await;
        let manager = Manager::new(config(&server.url())).unwrap();

        manager
            .send(OutboundMessage::new("ping", json!({})))
            .unwrap();
        manager.send(marker("queued")).unwrap();
        manager.connect().await.unwrap();
        manager.send(marker("after connect")).unwrap();

        let types: Vec<_> = [
            server.recv_frame().await.unwrap(),
            server.recv_frame().await.unwrap(),
            server.recv_frame().await.unwrap(),
        ]
        .iter()
        .map(|frame| (frame["type"].clone(), frame["data"]["label"].clone()))
        .collect();

        assert_eq!(
            types,
            vec![
                (json!("ping"), Value::Null),
                (json!("marker"), json!("queued")),
                (json!("marker"), json!("after connect")),
            ]
        );
    }

    #[tokio::test]
    async fn subscriptions_replay_before_queue_flush() {
        let mut server = MockWsServer::start().await;
        let manager = Manager::new(config(&server.url())).unwrap();

        manager.subscribe(aapl_ticks()).unwrap();
        manager.send(marker("queued")).unwrap();

        let first = server.recv_frame().await.unwrap();
        let second = server.recv_frame().await.unwrap();

        assert_eq!(first["type"], "subscribe");
        assert_eq!(second["data"]["label"], "queued");
    }

    #[tokio::test]
    async fn subscribe_from_connected_handler_is_sent_once() {
        let mut server = MockWsServer::start().await;
        let manager = Manager::new(config(&server.url())).unwrap();
        {
            let handle = manager.clone();
            manager.on(EventKind::Connected, move |_| {
                handle.subscribe(aapl_ticks()).unwrap();
            });
        }

        manager.connect().await.unwrap();
        manager.send(marker("done")).unwrap();

        let frames = server.recv_until("marker").await;
        let subscribes = frames
            .iter()
            .filter(|frame| frame["type"] == "subscribe")
            .count();
        assert_eq!(subscribes, 1);
        assert_eq!(manager.subscription_count(), 1);

        // Breaks the handler -> manager cycle
        manager.destroy();
    }
}

mod dispatch {
    use super::*;

    #[tokio::test]
    async fn routes_data_frames_by_channel() {
        let server = MockWsServer::start().await;
        let manager = Manager::new(config(&server.url())).unwrap();

        let (all_tx, mut all_rx) = mpsc::unbounded_channel();
        let (aapl_tx, mut aapl_rx) = mpsc::unbounded_channel();
        let msft_hits = Arc::new(AtomicUsize::new(0));
        manager.on(EventKind::Message, move |event| {
            if let Event::Message(message) = event {
                drop(all_tx.send(message.clone()));
            }
        });
        manager.on_channel("market_data_AAPL", move |message| {
            drop(aapl_tx.send(message.clone()));
        });
        {
            let msft_hits = Arc::clone(&msft_hits);
            manager.on_channel("market_data_MSFT", move |_| {
                msft_hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        manager.connect().await.unwrap();
        server.send(&json!({
            "type": "quote",
            "channel": "market_data_AAPL",
            "data": { "bid": 189.5, "ask": 189.55 }
        }));

        let generic = timeout(Duration::from_secs(2), all_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let scoped = timeout(Duration::from_secs(2), aapl_rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(generic.msg_type, "quote");
        assert_eq!(scoped, generic);
        assert_eq!(msft_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn control_frames_are_not_forwarded_and_errors_are() {
        let server = MockWsServer::start().await;
        let manager = Manager::new(config(&server.url())).unwrap();
        let mut messages = events(&manager, EventKind::Message);
        let mut errors = events(&manager, EventKind::Error);

        manager.connect().await.unwrap();
        server.send(&json!({ "type": "pong", "data": {} }));
        server.send(&json!({ "type": "subscription_success", "data": {}, "id": "1" }));
        server.send(&json!({ "type": "error", "data": { "message": "unknown symbol" } }));
        server.send(&json!({ "type": "tick", "data": { "px": 1 } }));

        let Event::Message(message) = next_event(&mut messages).await else {
            panic!("expected a message event");
        };
        assert_eq!(message.msg_type, "tick");

        let Event::Error(error) = next_event(&mut errors).await else {
            panic!("expected an error event");
        };
        assert_eq!(error, ErrorEvent::new(Kind::Server, "unknown symbol"));
        assert!(messages.try_recv().is_err(), "control frames are not data");
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped() {
        let server = MockWsServer::start().await;
        let manager = Manager::new(config(&server.url())).unwrap();
        let mut messages = events(&manager, EventKind::Message);

        manager.connect().await.unwrap();
        server.send_raw("{not json");
        server.send_raw("");
        server.send(&json!({ "type": "tick", "data": { "px": 2 } }));

        let Event::Message(message) = next_event(&mut messages).await else {
            panic!("expected a message event");
        };
        assert_eq!(message.data["px"], 2);
        assert!(manager.is_connected());
        assert_eq!(server.connections(), 1);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_break_dispatch() {
        let server = MockWsServer::start().await;
        let manager = Manager::new(config(&server.url())).unwrap();
        manager.on(EventKind::Message, |_| panic!("handler bug"));
        let mut messages = events(&manager, EventKind::Message);

        manager.connect().await.unwrap();
        server.send(&json!({ "type": "tick", "data": { "px": 1 } }));
        server.send(&json!({ "type": "tick", "data": { "px": 2 } }));

        next_event(&mut messages).await;
        next_event(&mut messages).await;
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn lagging_stream_reports_gap_and_keeps_going() {
        let server = MockWsServer::start().await;
        let mut config = config(&server.url());
        config.broadcast_capacity = 2;
        let manager = Manager::new(config).unwrap();
        let mut messages = events(&manager, EventKind::Message);
        let mut ticks = Box::pin(manager.stream());

        manager.connect().await.unwrap();
        for px in 0..10 {
            server.send(&json!({ "type": "tick", "data": { "px": px } }));
        }
        // Handlers run just before the broadcast, so give the last send a moment
        for _ in 0..10 {
            next_event(&mut messages).await;
        }
        sleep(Duration::from_millis(100)).await;

        let first = timeout(Duration::from_secs(2), ticks.next())
            .await
            .unwrap()
            .unwrap();
        let lagged = first.unwrap_err();
        assert!(matches!(
            lagged.downcast_ref::<WsError>(),
            Some(WsError::Lagged { count: 8 })
        ));

        let mut seen = Vec::new();
        server.send(&json!({ "type": "tick", "data": { "px": 10 } }));
        while seen.len() < 3 {
            let message = timeout(Duration::from_secs(2), ticks.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            seen.push(message.data["px"].as_i64().unwrap());
        }
        assert_eq!(seen, vec![8, 9, 10]);
    }

    #[tokio::test]
    async fn streams_yield_data_frames() {
        let server = MockWsServer::start().await;
        let manager = Manager::new(config(&server.url())).unwrap();
        let mut all = Box::pin(manager.stream());
        let mut msft = Box::pin(manager.channel_stream("market_data_MSFT"));

        manager.connect().await.unwrap();
        server.send(&json!({ "type": "tick", "channel": "market_data_AAPL", "data": {} }));
        server.send(&json!({ "type": "tick", "channel": "market_data_MSFT", "data": {} }));

        let first = timeout(Duration::from_secs(2), all.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(first.channel.as_deref(), Some("market_data_AAPL"));

        let scoped = timeout(Duration::from_secs(2), msft.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(scoped.channel.as_deref(), Some("market_data_MSFT"));

        manager.destroy();
        let rest: Vec<_> = timeout(Duration::from_secs(2), all.collect::<Vec<_>>())
            .await
            .unwrap();
        assert_eq!(rest.len(), 1, "stream ends after destroy");
    }
}

mod heartbeat {
    use super::*;

    #[tokio::test]
    async fn sends_timestamped_pings() {
        let mut server = MockWsServer::answering_pings().await;
        let mut config = config(&server.url());
        config.enable_heartbeat = true;
        config.heartbeat_interval = Duration::from_millis(100);
        let manager = Manager::new(config).unwrap();

        manager.connect().await.unwrap();

        let ping = server.recv_frame().await.unwrap();
        assert_eq!(ping["type"], "ping");
        assert!(ping["data"]["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn pongs_keep_connection_alive() {
        let server = MockWsServer::answering_pings().await;
        let mut config = config(&server.url());
        config.enable_heartbeat = true;
        config.heartbeat_interval = Duration::from_millis(50);
        config.heartbeat_timeout = Some(Duration::from_millis(150));
        let manager = Manager::new(config).unwrap();

        manager.connect().await.unwrap();
        sleep(Duration::from_millis(500)).await;

        assert!(manager.is_connected());
        assert_eq!(server.connections(), 1);
    }

    #[tokio::test]
    async fn silence_forces_reconnect() {
        let server = MockWsServer::start().await;
        let mut config = config(&server.url());
        config.enable_heartbeat = true;
        config.heartbeat_interval = Duration::from_millis(50);
        config.heartbeat_timeout = Some(Duration::from_millis(150));
        let manager = Manager::new(config).unwrap();
        let mut disconnected = events(&manager, EventKind::Disconnected);
        let mut errors = events(&manager, EventKind::Error);

        manager.connect().await.unwrap();

        let Event::Error(error) = next_event(&mut errors).await else {
            panic!("expected an error event");
        };
        assert_eq!(error.kind, Kind::Timeout);
        assert!(matches!(
            next_event(&mut disconnected).await,
            Event::Disconnected {
                reason: DisconnectReason::HeartbeatTimeout
            }
        ));

        let mut state_rx = manager.state_receiver();
        timeout(
            Duration::from_secs(2),
            state_rx.wait_for(|state| state.is_connected()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(server.connections(), 2);
    }
}

mod teardown {
    use super::*;

    #[tokio::test]
    async fn destroy_makes_manager_inert() {
        let mut server = MockWsServer::start().await;
        let manager = Manager::new(config(&server.url())).unwrap();
        let mut events_rx = events(&manager, EventKind::Disconnected);

        manager.connect().await.unwrap();
        manager.subscribe(aapl_ticks()).unwrap();
        server.recv_frame().await.unwrap();

        manager.destroy();

        assert!(manager.is_destroyed());
        assert!(manager.subscriptions().is_empty());
        assert_eq!(
            manager.send(marker("late")).unwrap_err().kind(),
            Kind::Destroyed
        );
        assert_eq!(
            manager.subscribe(aapl_ticks()).unwrap_err().kind(),
            Kind::Destroyed
        );
        assert_eq!(manager.connect().await.unwrap_err().kind(), Kind::Destroyed);
        manager.unsubscribe(&aapl_ticks()).unwrap_err();
        manager.clear_subscriptions().unwrap_err();
        manager.disconnect();
        manager.destroy();
        let id = manager.on(EventKind::Connected, |_| {});
        assert!(!manager.off(id));

        // Handlers were dropped before teardown, so the channel just closes
        assert!(
            timeout(Duration::from_secs(2), events_rx.recv())
                .await
                .unwrap()
                .is_none()
        );
        let mut state_rx = manager.state_receiver();
        timeout(
            Duration::from_secs(2),
            state_rx.wait_for(|state| *state == ConnectionState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();

        sleep(Duration::from_millis(200)).await;
        assert_eq!(server.connections(), 1);
        assert!(server.recv_frame().await.is_none(), "no traffic after destroy");
    }

    #[tokio::test]
    async fn clear_subscriptions_unsubscribes_everything() {
        let mut server = MockWsServer::start().await;
        let manager = Manager::new(config(&server.url())).unwrap();

        manager.connect().await.unwrap();
        manager.subscribe(aapl_ticks()).unwrap();
        manager
            .subscribe(SubscriptionRequest::new(["MSFT"], ["quote"]))
            .unwrap();
        manager.clear_subscriptions().unwrap();
        manager.send(marker("done")).unwrap();

        let frames = server.recv_until("marker").await;
        let count = |msg_type: &str| frames.iter().filter(|f| f["type"] == msg_type).count();
        assert_eq!(count("subscribe"), 2);
        assert_eq!(count("unsubscribe"), 2);
        assert_eq!(manager.subscription_count(), 0);
    }

    #[tokio::test]
    async fn rejects_invalid_input() {
        let err = Manager::new(Config::new("http://localhost:1")).unwrap_err();
        assert_eq!(err.kind(), Kind::Validation);

        let server = MockWsServer::start().await;
        let manager = Manager::new(config(&server.url())).unwrap();
        let err = manager
            .subscribe(SubscriptionRequest::new(Vec::<String>::new(), ["tick"]))
            .unwrap_err();
        assert_eq!(err.kind(), Kind::Validation);
        assert_eq!(manager.subscription_count(), 0);
    }
}
