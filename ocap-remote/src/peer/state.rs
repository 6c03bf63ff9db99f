//! Connection states and the legal transitions between them.

use serde::Serialize;

/// Connection state of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    /// No connection and nothing scheduled.
    Disconnected,
    /// A dial is in flight.
    Connecting,
    /// Handshake complete; one live connection.
    Connected,
    /// Waiting out a backoff timer before the next dial.
    BackingOff,
    /// Closed on request; only `reconnect_peer` reopens it.
    IntentionallyClosed,
}

impl PeerState {
    /// Whether `self -> to` is a legal transition.
    ///
    /// ```text
    /// Disconnected        -> Connecting | Connected | IntentionallyClosed
    /// Connecting          -> Connected | BackingOff | Disconnected | IntentionallyClosed
    /// Connected           -> BackingOff | Connecting | IntentionallyClosed
    /// BackingOff          -> Connecting | Connected | IntentionallyClosed
    /// IntentionallyClosed -> Connecting
    /// ```
    pub fn can_transition(self, to: PeerState) -> bool {
        use PeerState::*;
        matches!(
            (self, to),
            (Disconnected, Connecting | Connected | IntentionallyClosed)
                | (
                    Connecting,
                    Connected | BackingOff | Disconnected | IntentionallyClosed
                )
                | (Connected, BackingOff | Connecting | IntentionallyClosed)
                | (BackingOff, Connecting | Connected | IntentionallyClosed)
                | (IntentionallyClosed, Connecting)
        )
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::BackingOff => "backing_off",
            Self::IntentionallyClosed => "intentionally_closed",
        };
        f.write_str(name)
    }
}
