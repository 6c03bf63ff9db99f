//! Error types for peer connection handling.
//!
//! These never reach the kernel. The connection driver logs them and feeds
//! them into the backoff state machine.

use std::io;
use thiserror::Error;

use super::PeerState;
use crate::wire::WireError;

/// Errors that can occur while connecting to or talking with a peer.
#[derive(Error, Debug, Clone)]
pub enum PeerError {
    /// A dial plus handshake did not finish within the dial timeout
    #[error("dial timed out")]
    DialTimeout,

    /// The remote's handshake was missing, malformed or named the wrong peer
    #[error("handshake failed: {0}")]
    HandshakeFailure(String),

    /// No location hint or relay could route to the peer
    #[error("no addresses known for peer")]
    NoAddresses,

    /// The connection closed underneath us
    #[error("connection lost")]
    ConnectionLost,

    /// A frame did not drain within the write timeout
    #[error("write timed out")]
    WriteTimeout,

    /// A second connection lost the tie-break against an existing one
    #[error("duplicate connection")]
    DuplicateConnection,

    /// A state change outside the transition table
    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// State before the attempted transition.
        from: PeerState,
        /// Requested state.
        to: PeerState,
    },

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(String),

    /// Frame or envelope could not be decoded
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

impl From<io::Error> for PeerError {
    fn from(error: io::Error) -> Self {
        PeerError::Io(error.to_string())
    }
}

/// Result type for peer operations.
pub type PeerResult<T> = Result<T, PeerError>;
