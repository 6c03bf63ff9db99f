//! Sequence and acknowledgement counters for one peer.

/// Tracks outbound sequence numbers and inbound acknowledgement state.
///
/// - `sent_seq`: highest sequence number handed out
/// - `acked_seq`: highest sequence the peer has confirmed, never above `sent_seq`
/// - `received_seq`: highest sequence received from the peer's current incarnation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckTracker {
    sent_seq: u64,
    acked_seq: u64,
    received_seq: u64,
    ack_pending: bool,
}

impl AckTracker {
    /// Create a tracker with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next outbound sequence number, starting at 1.
    pub fn next_seq(&mut self) -> u64 {
        self.sent_seq += 1;
        self.sent_seq
    }

    /// Apply a cumulative ack from the peer. Returns the resulting `acked_seq`.
    pub fn record_ack(&mut self, seq: u64) -> u64 {
        self.acked_seq = self.acked_seq.max(seq.min(self.sent_seq));
        self.acked_seq
    }

    /// Note an inbound sequenced message.
    ///
    /// Returns `true` if `seq` was already seen and must not be delivered again.
    /// Duplicates still mark an ack as pending so the sender can trim its queue.
    pub fn record_received(&mut self, seq: u64) -> bool {
        self.ack_pending = true;
        if seq <= self.received_seq {
            return true;
        }
        self.received_seq = seq;
        false
    }

    /// Forget inbound state after the peer restarted; its numbering starts over.
    pub fn reset_received(&mut self) {
        self.received_seq = 0;
        self.ack_pending = false;
    }

    /// The value to place in the `ack` field of the next outbound frame.
    ///
    /// Clears the pending flag.
    pub fn take_ack(&mut self) -> u64 {
        self.ack_pending = false;
        self.received_seq
    }

    /// Whether received messages are waiting for an ack.
    pub fn ack_pending(&self) -> bool {
        self.ack_pending
    }

    /// Highest sequence number allocated.
    pub fn sent_seq(&self) -> u64 {
        self.sent_seq
    }

    /// Highest sequence number acknowledged by the peer.
    pub fn acked_seq(&self) -> u64 {
        self.acked_seq
    }

    /// Highest sequence number received from the peer.
    pub fn received_seq(&self) -> u64 {
        self.received_seq
    }
}
