//! Bounded per-peer outbound queue.
//!
//! Entries stay queued until the peer acknowledges them. A write cursor
//! separates entries already written on the current connection from those
//! still waiting; a new connection rewinds the cursor so every unacknowledged
//! entry is replayed in its original order.

use std::collections::VecDeque;
use std::collections::vec_deque::Iter;
use std::time::Duration;

use crate::OverflowPolicy;

/// A message waiting for acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage<T> {
    /// Sequence number assigned at enqueue time.
    pub seq: u64,
    /// Message body.
    pub body: T,
    /// Time the message was enqueued.
    pub enqueued_at: Duration,
}

/// The queue is full and the policy refuses new entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("queue at capacity ({capacity})")]
pub struct QueueFull {
    /// Configured capacity.
    pub capacity: usize,
}

/// Ordered, capacity-bounded buffer of unacknowledged messages.
#[derive(Debug, Clone)]
pub struct OutboundQueue<T> {
    entries: VecDeque<QueuedMessage<T>>,
    /// Number of leading entries already written on the current connection.
    cursor: usize,
    capacity: usize,
    policy: OverflowPolicy,
}

impl<T> OutboundQueue<T> {
    /// Create an empty queue. A capacity of 0 is treated as 1.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            entries: VecDeque::new(),
            cursor: 0,
            capacity: capacity.max(1),
            policy,
        }
    }

    /// Make room for one more entry according to the overflow policy.
    ///
    /// Call before allocating a sequence number so a rejected message never
    /// consumes one. Under `DropOldest` the evicted entry is returned.
    ///
    /// # Errors
    ///
    /// Returns [`QueueFull`] under `RejectNew` when the queue is full.
    pub fn admit(&mut self) -> Result<Option<QueuedMessage<T>>, QueueFull> {
        if self.entries.len() < self.capacity {
            return Ok(None);
        }
        match self.policy {
            OverflowPolicy::RejectNew => Err(QueueFull {
                capacity: self.capacity,
            }),
            OverflowPolicy::DropOldest => {
                let evicted = self.entries.pop_front();
                self.cursor = self.cursor.saturating_sub(1);
                Ok(evicted)
            }
        }
    }

    /// Append an entry. Callers go through [`OutboundQueue::admit`] first.
    pub fn enqueue(&mut self, seq: u64, body: T, enqueued_at: Duration) {
        debug_assert!(self.entries.back().is_none_or(|last| last.seq < seq));
        self.entries.push_back(QueuedMessage {
            seq,
            body,
            enqueued_at,
        });
    }

    /// Entries not yet written on the current connection, in order.
    ///
    /// All returned entries are marked written.
    pub fn drain(&mut self) -> Iter<'_, QueuedMessage<T>> {
        let start = self.cursor;
        self.cursor = self.entries.len();
        self.entries.range(start..)
    }

    /// Remove entries with `seq <= acked_seq`. Returns how many were removed.
    pub fn ack(&mut self, acked_seq: u64) -> usize {
        let mut removed = 0;
        while self.entries.front().is_some_and(|m| m.seq <= acked_seq) {
            self.entries.pop_front();
            self.cursor = self.cursor.saturating_sub(1);
            removed += 1;
        }
        removed
    }

    /// Mark every entry unwritten. Returns how many had been written before.
    pub fn rewind(&mut self) -> usize {
        std::mem::take(&mut self.cursor)
    }

    /// Keep only entries whose body satisfies `keep`, preserving order and the
    /// written/unwritten split. Returns how many were removed.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) -> usize {
        let before = self.entries.len();
        let cursor = self.cursor;
        let mut index = 0;
        let mut removed_written = 0;
        self.entries.retain(|message| {
            let kept = keep(&message.body);
            if !kept && index < cursor {
                removed_written += 1;
            }
            index += 1;
            kept
        });
        self.cursor -= removed_written;
        before - self.entries.len()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = 0;
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries not yet written on the current connection.
    pub fn unsent(&self) -> usize {
        self.entries.len() - self.cursor
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterate over all queued entries, oldest first.
    pub fn iter(&self) -> Iter<'_, QueuedMessage<T>> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(capacity: usize, policy: OverflowPolicy, count: u64) -> OutboundQueue<&'static str> {
        let mut queue = OutboundQueue::new(capacity, policy);
        for seq in 1..=count {
            queue.admit().expect("room");
            queue.enqueue(seq, "m", Duration::ZERO);
        }
        queue
    }

    fn seqs<T>(queue: &OutboundQueue<T>) -> Vec<u64> {
        queue.iter().map(|m| m.seq).collect()
    }

    #[test]
    fn test_drain_returns_unsent_in_order() {
        let mut queue = filled(10, OverflowPolicy::DropOldest, 3);
        let drained: Vec<u64> = queue.drain().map(|m| m.seq).collect();
        assert_eq!(drained, vec![1, 2, 3]);
        assert_eq!(queue.unsent(), 0);
        assert_eq!(queue.drain().count(), 0);

        queue.admit().expect("room");
        queue.enqueue(4, "m", Duration::ZERO);
        let drained: Vec<u64> = queue.drain().map(|m| m.seq).collect();
        assert_eq!(drained, vec![4]);
    }

    #[test]
    fn test_ack_removes_prefix_and_moves_cursor() {
        let mut queue = filled(10, OverflowPolicy::DropOldest, 4);
        queue.drain().for_each(drop);
        assert_eq!(queue.ack(2), 2);
        assert_eq!(seqs(&queue), vec![3, 4]);
        assert_eq!(queue.unsent(), 0);
        assert_eq!(queue.ack(2), 0);
    }

    #[test]
    fn test_rewind_replays_unacked() {
        let mut queue = filled(10, OverflowPolicy::DropOldest, 3);
        queue.drain().for_each(drop);
        queue.ack(1);
        assert_eq!(queue.rewind(), 2);
        let replay: Vec<u64> = queue.drain().map(|m| m.seq).collect();
        assert_eq!(replay, vec![2, 3]);
    }

    #[test]
    fn test_retain_keeps_written_split() {
        let mut queue = OutboundQueue::new(10, OverflowPolicy::DropOldest);
        for (seq, body) in [(1, "a"), (2, "b"), (3, "a"), (4, "b")] {
            queue.admit().expect("room");
            queue.enqueue(seq, body, Duration::ZERO);
        }
        // Only 1 and 2 have been written.
        queue.cursor = 2;

        assert_eq!(queue.retain(|body| *body == "a"), 2);
        assert_eq!(seqs(&queue), vec![1, 3]);
        assert_eq!(queue.unsent(), 1);
        let next: Vec<u64> = queue.drain().map(|m| m.seq).collect();
        assert_eq!(next, vec![3]);
    }

    #[test]
    fn test_drop_oldest_evicts_front() {
        let mut queue = filled(3, OverflowPolicy::DropOldest, 3);
        let evicted = queue.admit().expect("drop oldest never fails");
        assert_eq!(evicted.map(|m| m.seq), Some(1));
        queue.enqueue(4, "m", Duration::ZERO);
        assert_eq!(seqs(&queue), vec![2, 3, 4]);
        assert_eq!(queue.len(), queue.capacity());
    }

    #[test]
    fn test_drop_oldest_keeps_cursor_on_unsent() {
        let mut queue = filled(2, OverflowPolicy::DropOldest, 2);
        queue.drain().for_each(drop);
        queue.admit().expect("room");
        queue.enqueue(3, "m", Duration::ZERO);
        let next: Vec<u64> = queue.drain().map(|m| m.seq).collect();
        assert_eq!(next, vec![3]);
    }

    #[test]
    fn test_reject_new_leaves_queue_untouched() {
        let mut queue = filled(2, OverflowPolicy::RejectNew, 2);
        assert_eq!(queue.admit(), Err(QueueFull { capacity: 2 }));
        assert_eq!(seqs(&queue), vec![1, 2]);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let queue = filled(5, OverflowPolicy::DropOldest, 50);
        assert_eq!(queue.len(), 5);
        assert_eq!(seqs(&queue), vec![46, 47, 48, 49, 50]);
    }
}
