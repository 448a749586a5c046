//! Live market feed walkthrough.
//!
//! Connects to a market-data endpoint, subscribes to a couple of symbols and prints what
//! arrives through handlers and through a stream:
//! 1. Logs every lifecycle event (state changes, reconnects, errors)
//! 2. Routes quotes for one channel to a dedicated handler
//! 3. Reads the first few data frames from the merged stream
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=info,market_stream_client=debug \
//!     MARKET_WS_URL=wss://stream.example.com/ws \
//!     cargo run --example market_feed --features tracing
//! ```

use std::time::Duration;

use futures::StreamExt as _;
use market_stream_client::ws::{Config, Event, EventKind, Manager, SubscriptionRequest};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let url = std::env::var("MARKET_WS_URL").unwrap_or_else(|_| "ws://127.0.0.1:8080/ws".to_owned());
    let config = Config::builder()
        .url(url)
        .heartbeat_interval(Duration::from_secs(15))
        .reconnect_interval(Duration::from_secs(2))
        .build();
    let manager = Manager::new(config)?;

    manager.on(EventKind::StateChange, |event| {
        if let Event::StateChange { from, to } = event {
            info!(%from, %to, "State changed");
        }
    });
    manager.on(EventKind::Reconnecting, |event| {
        if let Event::Reconnecting {
            attempt,
            max_attempts,
            delay,
        } = event
        {
            warn!(attempt, max_attempts, ?delay, "Reconnecting");
        }
    });
    manager.on(EventKind::Error, |event| {
        if let Event::Error(error) = event {
            warn!(kind = ?error.kind, message = %error.message, "Stream error");
        }
    });
    manager.on_channel("market_data_AAPL", |message| {
        info!(channel = "market_data_AAPL", kind = %message.msg_type, data = %message.data);
    });

    manager.connect().await?;
    manager.subscribe(SubscriptionRequest::new(["AAPL", "MSFT"], ["quote", "tick"]))?;
    manager.subscribe(SubscriptionRequest::new(["BTC-USD"], ["kline"]).with_interval("1m"))?;
    info!(subscriptions = manager.subscription_count(), "Subscribed");

    let mut stream = Box::pin(manager.stream());
    let mut count = 0;
    while let Ok(Some(result)) = timeout(Duration::from_secs(30), stream.next()).await {
        match result {
            Ok(message) => {
                info!(
                    kind = %message.msg_type,
                    channel = ?message.channel,
                    data = %message.data
                );
                count += 1;
                if count >= 20 {
                    break;
                }
            }
            Err(e) => debug!(error = %e),
        }
    }
    info!(received = count);

    manager.destroy();
    Ok(())
}
