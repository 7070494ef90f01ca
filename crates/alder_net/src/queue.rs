//! Tick-gated pending message queue.
//!
//! Messages stamped for a tick the client has not reached yet wait
//! here. Each entry remembers its arrival order so that messages
//! released on the same drain pass replay in the order they arrived,
//! regardless of how the network interleaved them.

use crate::message::Message;

/// A queued message together with its arrival sequence number.
#[derive(Clone, Debug)]
pub struct PendingMessage {
    pub seq: u64,
    pub message: Message,
}

/// Holds messages until the local tick catches up with their stamp.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: Vec<PendingMessage>,
    next_seq: u64,
}

impl PendingQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Parks a message, returning its arrival sequence number.
    pub fn enqueue(&mut self, message: Message) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(PendingMessage { seq, message });
        seq
    }

    /// Runs `dispatch` over the queue in arrival order, removing each
    /// entry it reports as delivered.
    ///
    /// Entries that remain gated stay queued and are retried on the
    /// next drain. Removal adjusts the scan index in place, so a drain
    /// that delivers some entries and skips others visits every entry
    /// exactly once.
    pub fn drain(&mut self, mut dispatch: impl FnMut(&Message) -> bool) {
        self.entries.sort_by_key(|p| p.seq);
        let mut i = 0;
        while i < self.entries.len() {
            if dispatch(&self.entries[i].message) {
                self.entries.remove(i);
            } else {
                i += 1;
            }
        }
    }
}
