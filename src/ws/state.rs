#![expect(
    clippy::module_name_repetitions,
    reason = "State types are re-exported at the module root and read better with the suffix"
)]

/// Connection state tracking.
///
/// Exactly one state is active at a time. Only the connection task moves between states, and
/// only along the edges allowed by [`can_transition_to`](Self::can_transition_to).
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    /// Connect attempt in flight
    Connecting,
    /// Transport open; queued sends and subscription replay may proceed
    Connected,
    /// Manual disconnect in progress
    Disconnecting,
    /// No transport
    Disconnected,
    /// Last connect attempt failed
    Error,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Whether `next` is a legal successor of this state.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected, Self::Connecting)
                | (
                    Self::Connecting,
                    Self::Connected | Self::Error | Self::Disconnecting
                )
                | (Self::Connected, Self::Disconnected | Self::Disconnecting)
                | (Self::Error | Self::Disconnecting, Self::Disconnected)
        )
    }
}

/// Why a connection left `Connected` (or a connect attempt was abandoned).
///
/// Only [`Manual`](Self::Manual) suppresses reconnection.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` or `destroy()` was called
    Manual,
    /// The peer closed the connection
    Closed {
        /// WebSocket close code (1005 when the peer sent none, 1006 on abrupt EOF)
        code: u16,
        reason: String,
    },
    /// Reading from or writing to the socket failed
    TransportError(String),
    /// No frame arrived within the heartbeat timeout
    HeartbeatTimeout,
}

impl DisconnectReason {
    #[must_use]
    pub const fn is_manual(&self) -> bool {
        matches!(self, Self::Manual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ConnectionState; 5] = [
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::Disconnecting,
        ConnectionState::Disconnected,
        ConnectionState::Error,
    ];

    #[test]
    fn transition_table() {
        use ConnectionState::*;

        let allowed = [
            (Disconnected, Connecting),
            (Connecting, Connected),
            (Connecting, Error),
            (Connecting, Disconnecting),
            (Connected, Disconnected),
            (Connected, Disconnecting),
            (Error, Disconnected),
            (Disconnecting, Disconnected),
        ];

        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn only_connected_is_connected() {
        for state in ALL {
            assert_eq!(state.is_connected(), state == ConnectionState::Connected);
        }
    }

    #[test]
    fn display_is_snake_case() {
        assert_eq!(ConnectionState::Disconnecting.to_string(), "disconnecting");
        assert_eq!(ConnectionState::Error.to_string(), "error");
    }

    #[test]
    fn only_manual_reason_is_manual() {
        assert!(DisconnectReason::Manual.is_manual());
        assert!(!DisconnectReason::HeartbeatTimeout.is_manual());
        assert!(
            !DisconnectReason::Closed {
                code: 1000,
                reason: String::new()
            }
            .is_manual()
        );
    }
}
