use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::{DashMap, Entry};

use super::types::request::SubscriptionRequest;

#[derive(Debug, Clone)]
struct Registered {
    request: SubscriptionRequest,
    /// Position in the global order of registry mutations
    seq: u64,
}

/// What the application wants subscribed, keyed by [`SubscriptionRequest::key`].
///
/// Every mutation is stamped with a sequence number. The connection task replays entries
/// stamped below a watermark and skips live subscribe/unsubscribe commands stamped below it,
/// so a request racing a reconnect goes out exactly once.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    entries: DashMap<String, Registered>,
    next_seq: AtomicU64,
}

impl SubscriptionRegistry {
    /// Stores or replaces the request and calls `notify` while the entry is still locked.
    pub(crate) fn upsert<F, R>(&self, request: SubscriptionRequest, notify: F) -> R
    where
        F: FnOnce(u64, &SubscriptionRequest) -> R,
    {
        match self.entries.entry(request.key()) {
            Entry::Occupied(mut entry) => {
                let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                let registered = entry.get_mut();
                registered.request = request;
                registered.seq = seq;
                notify(seq, &registered.request)
            }
            Entry::Vacant(entry) => {
                let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                let registered = entry.insert(Registered { request, seq });
                notify(seq, &registered.request)
            }
        }
    }

    /// Removes the entry with `key`, calling `notify` before the lock is released.
    pub(crate) fn remove<F, R>(&self, key: &str, notify: F) -> Option<R>
    where
        F: FnOnce(u64, &SubscriptionRequest) -> R,
    {
        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(entry) => {
                let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                let result = notify(seq, &entry.get().request);
                entry.remove();
                Some(result)
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Entries to replay on a new connection, plus the watermark separating them from
    /// mutations whose own commands are still in flight.
    pub(crate) fn snapshot(&self) -> (u64, Vec<SubscriptionRequest>) {
        let watermark = self.next_seq.load(Ordering::SeqCst);
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .filter(|entry| entry.seq < watermark)
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by_key(|registered| registered.seq);
        (
            watermark,
            entries.into_iter().map(|r| r.request).collect(),
        )
    }

    /// Current entries, oldest mutation first.
    pub(crate) fn list(&self) -> Vec<SubscriptionRequest> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by_key(|registered| registered.seq);
        entries.into_iter().map(|r| r.request).collect()
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
    }
}
