//! Outstanding requests waiting for an `Ack`.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tracing::debug;

use crate::protocol::{AckStatus, CorrelationId};

/// Map of correlation id to the party waiting on it. The first matching ack
/// clears the entry; later duplicates find nothing.
#[derive(Default)]
pub struct CorrelationTracker {
    pending: DashMap<CorrelationId, oneshot::Sender<AckStatus>>,
}

impl CorrelationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh id and wait on it.
    pub fn next(&self) -> (CorrelationId, oneshot::Receiver<AckStatus>) {
        loop {
            let id = CorrelationId::new_random();
            if let Some(rx) = self.register(id) {
                return (id, rx);
            }
        }
    }

    /// Wait on a specific id. `None` for `EMPTY` or an id already pending.
    pub fn register(&self, id: CorrelationId) -> Option<oneshot::Receiver<AckStatus>> {
        if id.is_empty() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        match self.pending.entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(tx);
                Some(rx)
            }
        }
    }

    /// Complete the waiter for `id`. Returns `false` when nothing was
    /// waiting, which covers duplicate acks.
    pub fn resolve(&self, id: CorrelationId, status: AckStatus) -> bool {
        match self.pending.remove(&id) {
            Some((_, waiter)) => {
                // the waiter may have stopped listening; the entry is cleared either way
                let _ = waiter.send(status);
                true
            }
            None => {
                debug!(correlation = %id, "ack with no pending request");
                false
            }
        }
    }

    /// Stop waiting on `id` without an answer.
    pub fn forget(&self, id: CorrelationId) {
        self.pending.remove(&id);
    }

    /// Drop every waiter; their receivers observe a closed channel.
    pub fn abandon_all(&self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
