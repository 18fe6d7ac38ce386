//! Broadcasts held back while a conversation is in polling fallback.
//!
//! Typing indicators are state, not events: only the latest status per user
//! matters. Read receipts are events and are kept in arrival order, with the
//! oldest dropped once the bound is reached. Replay coalesces receipts into
//! one batch per user.

use std::collections::{HashSet, VecDeque};

use murmur_proto::{Broadcast, MessageId, ReadReceiptEvent, TypingStatus};

/// Per-conversation degraded-mode queue.
#[derive(Debug, Default)]
pub(crate) struct DegradedQueue {
    typing: VecDeque<TypingStatus>,
    receipts: VecDeque<ReadReceiptEvent>,
}

impl DegradedQueue {
    /// Queue a broadcast. Returns the number of entries evicted to stay
    /// within the limits.
    pub(crate) fn push(
        &mut self,
        broadcast: Broadcast,
        typing_limit: usize,
        receipt_limit: usize,
    ) -> usize {
        match broadcast {
            Broadcast::Typing(status) => {
                self.typing.retain(|queued| queued.user_id != status.user_id);
                self.typing.push_back(status);
                evict_oldest(&mut self.typing, typing_limit)
            },
            Broadcast::ReadReceipt(event) => {
                self.receipts.push_back(event);
                evict_oldest(&mut self.receipts, receipt_limit)
            },
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.typing.len() + self.receipts.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.typing.is_empty() && self.receipts.is_empty()
    }

    pub(crate) fn clear(&mut self) -> usize {
        let dropped = self.len();
        self.typing.clear();
        self.receipts.clear();
        dropped
    }

    /// Empty the queue into the broadcasts to replay.
    ///
    /// Read receipts come first, one per user in first-seen order, carrying
    /// the de-duplicated union of their message IDs and the latest
    /// timestamp. Typing statuses follow, latest per user.
    pub(crate) fn drain_coalesced(&mut self) -> Vec<Broadcast> {
        let mut merged: Vec<(ReadReceiptEvent, HashSet<MessageId>)> = Vec::new();

        for event in self.receipts.drain(..) {
            match merged.iter_mut().find(|(batch, _)| batch.user_id == event.user_id) {
                Some((batch, seen)) => {
                    for id in event.message_ids {
                        if seen.insert(id.clone()) {
                            batch.message_ids.push(id);
                        }
                    }
                    batch.timestamp_ms = batch.timestamp_ms.max(event.timestamp_ms);
                },
                None => {
                    let mut seen = HashSet::new();
                    let mut batch = event;
                    batch.message_ids.retain(|id| seen.insert(id.clone()));
                    merged.push((batch, seen));
                },
            }
        }

        merged
            .into_iter()
            .map(|(batch, _)| Broadcast::ReadReceipt(batch))
            .chain(self.typing.drain(..).map(Broadcast::Typing))
            .collect()
    }
}

fn evict_oldest<T>(queue: &mut VecDeque<T>, limit: usize) -> usize {
    let mut evicted = 0;
    while queue.len() > limit {
        queue.pop_front();
        evicted += 1;
    }
    evicted
}
