//! Per-peer counters.

use serde::Serialize;
use std::time::Duration;

/// Counters and timestamps for one peer.
///
/// Timestamps are provider time (elapsed since the providers were created).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PeerMetrics {
    /// Dials started.
    pub connection_attempts: u64,
    /// Connections that completed a handshake, in either direction.
    pub connections_established: u64,
    /// Dials that failed or timed out.
    pub connection_failures: u64,
    /// Established connections that later dropped.
    pub connections_lost: u64,
    /// Connections dropped by the duplicate-connection tie-break.
    pub duplicate_connections: u64,
    /// Messages written, including retransmissions.
    pub messages_sent: u64,
    /// Bytes written.
    pub bytes_sent: u64,
    /// New messages delivered to the kernel.
    pub messages_received: u64,
    /// Bytes read.
    pub bytes_received: u64,
    /// Messages replayed after a reconnect.
    pub messages_retransmitted: u64,
    /// Inbound messages suppressed as duplicates.
    pub duplicates_dropped: u64,
    /// Queued messages discarded before the peer acknowledged them.
    pub messages_dropped: u64,
    /// Times the transport gave up on this peer.
    pub give_ups: u64,
    /// Whether a live connection exists.
    pub is_connected: bool,
    /// Time of the last established connection.
    pub last_connected_at: Option<Duration>,
    /// Time of the last dial failure.
    pub last_failure_at: Option<Duration>,
}

impl PeerMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_connection_attempt(&mut self) {
        self.connection_attempts += 1;
    }

    pub(crate) fn record_connection_established(&mut self, now: Duration) {
        self.connections_established += 1;
        self.is_connected = true;
        self.last_connected_at = Some(now);
    }

    pub(crate) fn record_connection_failure(&mut self, now: Duration) {
        self.connection_failures += 1;
        self.last_failure_at = Some(now);
    }

    pub(crate) fn record_connection_lost(&mut self) {
        self.connections_lost += 1;
        self.is_connected = false;
    }

    pub(crate) fn record_message_sent(&mut self, bytes: usize) {
        self.messages_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub(crate) fn record_message_received(&mut self) {
        self.messages_received += 1;
    }

    pub(crate) fn record_bytes_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
    }

    pub(crate) fn record_messages_dropped(&mut self, count: usize) {
        self.messages_dropped += count as u64;
    }
}
