//! Restart detection from handshake incarnation ids.

use ocap_core::IncarnationId;

/// Outcome of observing a peer's incarnation in a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncarnationChange {
    /// First handshake with this peer.
    First,
    /// Same process as before; an ordinary reconnect.
    Same,
    /// The peer restarted.
    Changed {
        /// Incarnation seen before the restart.
        previous: IncarnationId,
    },
}

/// Remembers the last incarnation seen for one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncarnationTracker {
    current: Option<IncarnationId>,
}

impl IncarnationTracker {
    /// Create a tracker that has seen nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the incarnation from a handshake and classify it.
    pub fn observe(&mut self, incarnation: IncarnationId) -> IncarnationChange {
        match self.current.replace(incarnation) {
            None => IncarnationChange::First,
            Some(previous) if previous == incarnation => IncarnationChange::Same,
            Some(previous) => IncarnationChange::Changed { previous },
        }
    }

    /// Last incarnation observed, if any.
    pub fn current(&self) -> Option<IncarnationId> {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_sequence() {
        let a = IncarnationId::new(1, 1);
        let b = IncarnationId::new(2, 2);
        let mut tracker = IncarnationTracker::new();

        assert_eq!(tracker.current(), None);
        assert_eq!(tracker.observe(a), IncarnationChange::First);
        assert_eq!(tracker.observe(a), IncarnationChange::Same);
        assert_eq!(
            tracker.observe(b),
            IncarnationChange::Changed { previous: a }
        );
        assert_eq!(tracker.current(), Some(b));
    }
}
