//! Per-peer bookkeeping shared by the manager and the connection driver.

use std::collections::BTreeMap;
use std::time::Duration;

use ocap_core::{IncarnationId, PeerAddress, PeerId};
use serde::Serialize;

use super::error::{PeerError, PeerResult};
use super::{PeerMetrics, PeerState};
use crate::handler::{OutboundMessage, PromiseId};
use crate::queue::{OutboundQueue, QueueFull};
use crate::wire::{Deliver, MessageBody, Reply};
use crate::{AckTracker, IncarnationTracker, OverflowPolicy};

/// Everything the transport knows about one peer.
///
/// Lives behind `Rc<RefCell<_>>`. Borrows are short and never held across an
/// await point.
#[derive(Debug)]
pub(crate) struct PeerRecord {
    peer_id: PeerId,
    state: PeerState,
    /// Consecutive failed dials since the last success or restart.
    pub attempt: u32,
    pub incarnation: IncarnationTracker,
    /// Most recently registered first.
    location_hints: Vec<String>,
    pub queue: OutboundQueue<MessageBody>,
    pub acks: AckTracker,
    bindings: BTreeMap<u64, PromiseId>,
    next_binding: u64,
    pub metrics: PeerMetrics,
}

impl PeerRecord {
    pub fn new(peer_id: PeerId, max_queue: usize, policy: OverflowPolicy) -> Self {
        Self {
            peer_id,
            state: PeerState::Disconnected,
            attempt: 0,
            incarnation: IncarnationTracker::new(),
            location_hints: Vec::new(),
            queue: OutboundQueue::new(max_queue, policy),
            acks: AckTracker::new(),
            bindings: BTreeMap::new(),
            next_binding: 1,
            metrics: PeerMetrics::new(),
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Move to `to` if the transition table allows it. Same-state is a no-op.
    pub fn transition(&mut self, to: PeerState) -> PeerResult<()> {
        let from = self.state;
        if from == to {
            return Ok(());
        }
        if !from.can_transition(to) {
            return Err(PeerError::InvalidTransition { from, to });
        }
        tracing::debug!(peer = %self.peer_id.short(), %from, %to, "peer state transition");
        self.state = to;
        Ok(())
    }

    /// Merge location hints. Returns how many were accepted.
    pub fn add_hints<I>(&mut self, hints: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let mut accepted = 0;
        for hint in hints {
            if PeerAddress::parse(&hint).is_none() {
                tracing::warn!(peer = %self.peer_id.short(), hint = %hint, "skipping unrecognized location hint");
                continue;
            }
            self.location_hints.retain(|h| h != &hint);
            self.location_hints.insert(0, hint);
            accepted += 1;
        }
        accepted
    }

    /// Addresses to try, in order: hints, then a circuit through each relay.
    pub fn dial_candidates(&self, relays: &[String]) -> Vec<PeerAddress> {
        let mut candidates: Vec<PeerAddress> = Vec::new();
        let circuits = relays
            .iter()
            .map(|relay| format!("{}/p2p-circuit/p2p/{}", relay, self.peer_id));
        for addr in self.location_hints.iter().cloned().chain(circuits) {
            if let Some(parsed) = PeerAddress::parse(&addr)
                && !candidates.contains(&parsed)
            {
                candidates.push(parsed);
            }
        }
        candidates
    }

    /// Queue an application message, binding its promise if it has one.
    pub fn enqueue_message(
        &mut self,
        message: OutboundMessage,
        now: Duration,
    ) -> Result<u64, QueueFull> {
        self.make_room()?;
        let reply_to = message.promise.map(|promise| self.bind(promise));
        let body = MessageBody::Deliver(Deliver {
            payload: message.payload,
            reply_to,
        });
        Ok(self.push(body, now))
    }

    /// Queue a reply to a message that carried `reply_to`.
    pub fn enqueue_reply(
        &mut self,
        reply_to: u64,
        payload: Vec<u8>,
        now: Duration,
    ) -> Result<u64, QueueFull> {
        self.make_room()?;
        Ok(self.push(MessageBody::Reply(Reply { reply_to, payload }), now))
    }

    fn make_room(&mut self) -> Result<(), QueueFull> {
        if let Some(evicted) = self.queue.admit()? {
            self.metrics.record_messages_dropped(1);
            tracing::warn!(
                peer = %self.peer_id.short(),
                seq = evicted.seq,
                capacity = self.queue.capacity(),
                "queue full, dropped oldest message"
            );
        }
        Ok(())
    }

    fn push(&mut self, body: MessageBody, now: Duration) -> u64 {
        let seq = self.acks.next_seq();
        self.queue.enqueue(seq, body, now);
        seq
    }

    fn bind(&mut self, promise: PromiseId) -> u64 {
        let id = self.next_binding;
        self.next_binding += 1;
        self.bindings.insert(id, promise);
        id
    }

    /// Remove the binding settled by a reply.
    pub fn take_binding(&mut self, reply_to: u64) -> Option<PromiseId> {
        self.bindings.remove(&reply_to)
    }

    pub fn pending_bindings(&self) -> usize {
        self.bindings.len()
    }

    /// Apply a cumulative ack and retire acknowledged entries.
    pub fn apply_ack(&mut self, ack: u64) -> usize {
        let acked = self.acks.record_ack(ack);
        self.queue.ack(acked)
    }

    /// Peer restarted: forget its sequence numbering and retry from scratch.
    ///
    /// Queued replies answer promises of the previous incarnation and would
    /// settle unrelated bindings in the new one, so they are dropped. Returns
    /// how many were dropped.
    pub fn on_restart(&mut self) -> usize {
        self.attempt = 0;
        self.acks.reset_received();
        let stale = self
            .queue
            .retain(|body| !matches!(body, MessageBody::Reply(_)));
        self.metrics.record_messages_dropped(stale);
        stale
    }

    /// Give up on the peer. Returns the promises to reject.
    pub fn give_up(&mut self) -> PeerResult<Vec<PromiseId>> {
        self.transition(PeerState::Disconnected)?;
        self.attempt = 0;
        self.metrics.give_ups += 1;
        self.metrics.record_messages_dropped(self.queue.len());
        self.queue.clear();
        Ok(std::mem::take(&mut self.bindings).into_values().collect())
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            peer_id: self.peer_id.clone(),
            state: self.state,
            attempt: self.attempt,
            incarnation: self.incarnation.current(),
            location_hints: self.location_hints.clone(),
            queue_len: self.queue.len(),
            unsent: self.queue.unsent(),
            sent_seq: self.acks.sent_seq(),
            acked_seq: self.acks.acked_seq(),
            received_seq: self.acks.received_seq(),
            pending_bindings: self.bindings.len(),
            metrics: self.metrics.clone(),
        }
    }
}

/// Point-in-time view of a peer, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerSnapshot {
    /// Peer identifier.
    pub peer_id: PeerId,
    /// Connection state.
    pub state: PeerState,
    /// Consecutive failed dials.
    pub attempt: u32,
    /// Last incarnation seen in a handshake.
    pub incarnation: Option<IncarnationId>,
    /// Location hints, most recent first.
    pub location_hints: Vec<String>,
    /// Queued messages awaiting ack.
    pub queue_len: usize,
    /// Queued messages not yet written on the current connection.
    pub unsent: usize,
    /// Highest outbound sequence allocated.
    pub sent_seq: u64,
    /// Highest outbound sequence acknowledged.
    pub acked_seq: u64,
    /// Highest inbound sequence received.
    pub received_seq: u64,
    /// Promises awaiting a reply from this peer.
    pub pending_bindings: usize,
    /// Counters.
    pub metrics: PeerMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(capacity: usize, policy: OverflowPolicy) -> PeerRecord {
        PeerRecord::new(PeerId::from_seed(b"bob").expect("seed"), capacity, policy)
    }

    #[test]
    fn test_transition_rejects_illegal_moves() {
        let mut rec = record(10, OverflowPolicy::DropOldest);
        rec.transition(PeerState::IntentionallyClosed).expect("close");
        let err = rec.transition(PeerState::Connected).expect_err("illegal");
        assert!(matches!(
            err,
            PeerError::InvalidTransition {
                from: PeerState::IntentionallyClosed,
                to: PeerState::Connected
            }
        ));
        rec.transition(PeerState::IntentionallyClosed)
            .expect("same state is a no-op");
    }

    #[test]
    fn test_hints_most_recent_first_and_deduplicated() {
        let mut rec = record(10, OverflowPolicy::DropOldest);
        rec.add_hints(["/memory/a".to_string(), "/memory/b".to_string()]);
        assert_eq!(rec.add_hints(["/memory/a".to_string(), "bogus".to_string()]), 1);
        assert_eq!(rec.snapshot().location_hints, ["/memory/a", "/memory/b"]);
    }

    #[test]
    fn test_dial_candidates_include_relay_circuits() {
        let mut rec = record(10, OverflowPolicy::DropOldest);
        rec.add_hints(["/ip4/10.0.0.1/tcp/4001".to_string()]);
        let relays = vec!["/dns4/relay.example/tcp/443/wss/p2p/r1".to_string()];
        let candidates: Vec<String> = rec
            .dial_candidates(&relays)
            .iter()
            .map(|a| a.to_string())
            .collect();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0], "/ip4/10.0.0.1/tcp/4001");
        assert!(candidates[1].ends_with(&format!("/p2p-circuit/p2p/{}", rec.peer_id)));
    }

    #[test]
    fn test_enqueue_binds_promise() {
        let mut rec = record(10, OverflowPolicy::DropOldest);
        let seq = rec
            .enqueue_message(
                OutboundMessage::expecting_reply(b"hi".to_vec(), PromiseId::new("kp1")),
                Duration::ZERO,
            )
            .expect("enqueue");
        assert_eq!(seq, 1);
        assert_eq!(rec.pending_bindings(), 1);
        let Some(MessageBody::Deliver(deliver)) = rec.queue.iter().next().map(|m| &m.body) else {
            panic!("expected a deliver body");
        };
        let reply_to = deliver.reply_to.expect("bound");
        assert_eq!(rec.take_binding(reply_to), Some(PromiseId::new("kp1")));
        assert_eq!(rec.take_binding(reply_to), None);
    }

    #[test]
    fn test_reject_new_consumes_no_sequence() {
        let mut rec = record(1, OverflowPolicy::RejectNew);
        rec.enqueue_message(OutboundMessage::notify(b"a".to_vec()), Duration::ZERO)
            .expect("first fits");
        let full = rec.enqueue_message(
            OutboundMessage::expecting_reply(b"b".to_vec(), PromiseId::new("kp")),
            Duration::ZERO,
        );
        assert_eq!(full, Err(QueueFull { capacity: 1 }));
        assert_eq!(rec.acks.sent_seq(), 1);
        assert_eq!(rec.pending_bindings(), 0);
    }

    #[test]
    fn test_restart_drops_queued_replies_only() {
        let mut rec = record(10, OverflowPolicy::DropOldest);
        rec.enqueue_message(OutboundMessage::notify(b"a".to_vec()), Duration::ZERO)
            .expect("enqueue");
        rec.enqueue_reply(1, b"stale".to_vec(), Duration::ZERO)
            .expect("enqueue");
        rec.enqueue_message(OutboundMessage::notify(b"b".to_vec()), Duration::ZERO)
            .expect("enqueue");
        assert_eq!(rec.queue.drain().count(), 3);
        rec.acks.record_received(4);

        assert_eq!(rec.on_restart(), 1);
        assert_eq!(rec.queue.len(), 2);
        assert_eq!(rec.queue.unsent(), 0);
        assert!(
            rec.queue
                .iter()
                .all(|m| matches!(m.body, MessageBody::Deliver(_)))
        );
        assert_eq!(rec.acks.received_seq(), 0);
        assert_eq!(rec.metrics.messages_dropped, 1);
    }

    #[test]
    fn test_give_up_returns_every_binding_once() {
        let mut rec = record(10, OverflowPolicy::DropOldest);
        for i in 0..3 {
            rec.enqueue_message(
                OutboundMessage::expecting_reply(vec![i], PromiseId::new(format!("kp{i}"))),
                Duration::ZERO,
            )
            .expect("enqueue");
        }
        rec.transition(PeerState::Connecting).expect("dial");
        let rejected = rec.give_up().expect("give up");
        assert_eq!(rejected.len(), 3);
        assert_eq!(rec.state(), PeerState::Disconnected);
        assert!(rec.queue.is_empty());
        assert_eq!(rec.metrics.give_ups, 1);
        assert!(rec.give_up().expect("again").is_empty());
    }
}
