//! Error types surfaced to the kernel by the remote transport.

use ocap_core::PeerId;

/// Errors returned by [`crate::RemoteTransportManager`] and used to reject
/// kernel promises.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// `initialize_remote_comms` called twice without an intervening stop.
    #[error("remote comms already initialized")]
    AlreadyInitialized,

    /// Operation requires initialized remote comms.
    #[error("remote comms not initialized")]
    NotInitialized,

    /// Options failed validation.
    #[error("invalid remote comms options: {0}")]
    InvalidOptions(String),

    /// The identity seed could not produce a peer id.
    #[error("invalid identity seed")]
    InvalidIdentitySeed,

    /// A direct-listen address could not be bound.
    #[error("failed to listen on {address}: {message}")]
    Listen {
        /// Address that failed to bind.
        address: String,
        /// Underlying I/O error.
        message: String,
    },

    /// Payload is larger than a single frame can carry.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Payload size in bytes.
        size: usize,
        /// Largest accepted payload.
        max: usize,
    },

    /// The peer's outbound queue is full and the overflow policy rejects new messages.
    #[error("queue for peer {peer} at capacity ({capacity})")]
    QueueAtCapacity {
        /// Destination peer.
        peer: PeerId,
        /// Configured queue capacity.
        capacity: usize,
    },

    /// The transport gave up on the peer after exhausting retries.
    #[error("connection to peer {peer} lost")]
    RemoteConnectionLost {
        /// Peer that was given up on.
        peer: PeerId,
    },

    /// The connection was closed on purpose and has not been reopened.
    #[error("connection to peer {peer} was intentionally closed")]
    IntentionalCloseBlocksDelivery {
        /// Peer whose connection is closed.
        peer: PeerId,
    },
}

/// Result type for manager operations.
pub type RemoteResult<T> = Result<T, RemoteError>;
