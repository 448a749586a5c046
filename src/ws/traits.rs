//! Core traits for the WebSocket transport.

use super::types::response::{InboundMessage, parse_messages};

/// Message parser trait for converting raw frames to messages.
///
/// The default [`JsonParser`] understands the envelope format used by the market-data feed.
/// A custom parser can adapt a different wire layout, or drop frames early, as long as it
/// produces [`InboundMessage`] envelopes.
///
/// # Example
///
/// ```
/// use market_stream_client::ws::{InboundMessage, MessageParser};
///
/// struct TickOnly;
///
/// impl MessageParser for TickOnly {
///     fn parse(&self, bytes: &[u8]) -> market_stream_client::Result<Vec<InboundMessage>> {
///         let mut messages = market_stream_client::ws::parse_messages(bytes)?;
///         messages.retain(|m| m.msg_type == "tick" || m.msg_type == "pong");
///         Ok(messages)
///     }
/// }
/// ```
pub trait MessageParser: Send + Sync + 'static {
    /// Parse incoming bytes into messages.
    ///
    /// May return an empty vec for keepalive frames or filtered messages.
    fn parse(&self, bytes: &[u8]) -> crate::Result<Vec<InboundMessage>>;
}

/// Parses JSON envelopes, either a single object or an array.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonParser;

impl MessageParser for JsonParser {
    fn parse(&self, bytes: &[u8]) -> crate::Result<Vec<InboundMessage>> {
        parse_messages(bytes)
    }
}
