use std::future::pending;
use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep_until};

/// Outcome of waiting on the heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Beat {
    /// Time to send a `ping`
    Ping,
    /// Nothing was received for the given timeout
    Expired(Duration),
}

/// Liveness monitor for one connection session.
///
/// Any inbound frame counts as a sign of life, not only `pong`: a busy feed proves the peer is
/// alive even if it answers pings late.
#[derive(Debug)]
pub(crate) struct Heartbeat {
    ticker: Interval,
    timeout: Option<Duration>,
    last_seen: Instant,
}

impl Heartbeat {
    /// First ping goes out one full interval after the connection opened.
    pub(crate) fn start(every: Duration, timeout: Option<Duration>) -> Self {
        let now = Instant::now();
        let mut ticker = interval_at(now + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            ticker,
            timeout,
            last_seen: now,
        }
    }

    pub(crate) fn record_activity(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Waits for the next ping slot or for the silence deadline, whichever is first.
    ///
    /// Cancel safe: dropping the future loses no tick.
    pub(crate) async fn tick(&mut self) -> Beat {
        let deadline = self.timeout.map(|timeout| (self.last_seen + timeout, timeout));
        let expiry = async move {
            match deadline {
                Some((at, timeout)) => {
                    sleep_until(at).await;
                    timeout
                }
                None => pending().await,
            }
        };

        tokio::select! {
            biased;

            timeout = expiry => Beat::Expired(timeout),
            _ = self.ticker.tick() => Beat::Ping,
        }
    }
}
