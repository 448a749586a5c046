use std::collections::VecDeque;

use super::types::request::OutboundMessage;

/// Messages issued while no connection was usable, drained in insertion order.
#[derive(Debug, Default)]
pub(crate) struct OutboundQueue {
    pending: VecDeque<OutboundMessage>,
}

impl OutboundQueue {
    pub(crate) fn push(&mut self, message: OutboundMessage) {
        self.pending.push_back(message);
    }

    pub(crate) fn pop_front(&mut self) -> Option<OutboundMessage> {
        self.pending.pop_front()
    }

    #[cfg(any(test, feature = "tracing"))]
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }
}
