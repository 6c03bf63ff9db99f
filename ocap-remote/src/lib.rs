//! # ocap-remote
//!
//! Reliable message transport between capability kernels.
//!
//! This crate provides:
//! - **Peer management**: one background task per remote kernel with automatic
//!   reconnection and exponential backoff
//! - **Bounded queues**: per-peer outbound queues with a configurable overflow policy
//! - **Acknowledgements**: cumulative acks, in-order replay after reconnect, and
//!   duplicate suppression on the receiving side
//! - **Incarnation tracking**: detects when a peer restarted
//! - **Wire format**: length-prefixed JSON envelopes with CRC32C checksums
//!
//! Everything runs on a single-threaded Tokio runtime inside a `LocalSet`.
//! The kernel talks to the transport through [`RemoteTransportManager`] and
//! receives messages and promise settlements through [`RemoteHandler`].

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// Re-export core types for convenience
pub use ocap_core::{
    Dialer, IdentityError, IncarnationId, Listener, PeerAddress, PeerId, Providers,
    TokioProviders, TransportKind,
};

// =============================================================================
// Modules
// =============================================================================

/// Cumulative acknowledgement bookkeeping.
pub mod ack;

/// Reconnection delay calculation.
pub mod backoff;

/// Options validated at initialize.
pub mod config;

/// Errors surfaced to the kernel.
pub mod error;

/// Kernel callbacks and outbound messages.
pub mod handler;

/// Peer restart detection.
pub mod incarnation;

/// Lifecycle and public API.
pub mod manager;

/// Resilient peer connection management.
pub mod peer;

/// Bounded per-peer outbound queue.
pub mod queue;

/// Framing and envelopes.
pub mod wire;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use ack::AckTracker;
pub use backoff::BackoffScheduler;
pub use config::{BackoffConfig, DEFAULT_MAX_QUEUE, OverflowPolicy, RemoteCommsOptions};
pub use error::{RemoteError, RemoteResult};
pub use handler::{OutboundMessage, PromiseId, RemoteHandler};
pub use incarnation::{IncarnationChange, IncarnationTracker};
pub use manager::RemoteTransportManager;
pub use peer::{PeerError, PeerMetrics, PeerSnapshot, PeerState};
pub use queue::{OutboundQueue, QueueFull, QueuedMessage};
pub use wire::{MAX_MESSAGE_SIZE, WireError};
