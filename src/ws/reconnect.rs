//! Reconnection schedule.
//!
//! Retries are spaced linearly: the n-th attempt after a drop waits `interval × n`, and no
//! attempt is made past `max_attempts`. A successful open resets the schedule.

#![expect(
    clippy::module_name_repetitions,
    reason = "Reconnect types are re-exported at the module root and read better with the prefix"
)]

use std::time::Duration;

use backoff::backoff::Backoff;

/// Linear backoff bounded by a maximum number of attempts.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    interval: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl LinearBackoff {
    #[must_use]
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            attempts: 0,
        }
    }

    /// Attempts handed out since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Backoff for LinearBackoff {
    fn reset(&mut self) {
        self.attempts = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.interval.saturating_mul(self.attempts))
    }
}

/// What to do after a connection was lost or an attempt failed.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Try again after `delay`
    Retry {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    /// Attempts are used up; only an explicit `connect()` starts over
    Exhausted { attempts: u32 },
}

/// Owns the attempt counter and decides whether another attempt is allowed.
#[derive(Debug)]
pub(crate) struct ReconnectController {
    backoff: LinearBackoff,
    enabled: bool,
}

impl ReconnectController {
    pub(crate) const fn new(backoff: LinearBackoff, enabled: bool) -> Self {
        Self { backoff, enabled }
    }

    /// `None` when automatic reconnection is turned off.
    pub(crate) fn next_attempt(&mut self) -> Option<ReconnectDecision> {
        if !self.enabled {
            return None;
        }
        let decision = match self.backoff.next_backoff() {
            Some(delay) => ReconnectDecision::Retry {
                attempt: self.backoff.attempts(),
                max_attempts: self.backoff.max_attempts(),
                delay,
            },
            None => ReconnectDecision::Exhausted {
                attempts: self.backoff.attempts(),
            },
        };
        Some(decision)
    }

    pub(crate) fn reset(&mut self) {
        self.backoff.reset();
    }
}
