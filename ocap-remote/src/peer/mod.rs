//! Resilient per-peer connection management.
//!
//! Each remote kernel gets a [`PeerRecord`](record::PeerRecord) holding its
//! outbound queue, sequence counters and promise bindings, plus one background
//! driver task that dials, handshakes, writes and reads.
//!
//! # Connection Lifecycle
//!
//! ```text
//! ┌──────────────┐  send   ┌────────────┐  handshake  ┌───────────┐
//! │ Disconnected ├────────►│ Connecting ├────────────►│ Connected │
//! └──────▲───────┘         └──┬──────▲──┘             └─────┬─────┘
//!        │ give up            │      │ timer                │ drop
//!        │                    ▼      │                      │
//!        │               ┌───────────┴┐                     │
//!        └───────────────┤ BackingOff │◄────────────────────┘
//!                        └────────────┘
//! ```
//!
//! `IntentionallyClosed` is reachable from every state and left only through
//! an explicit reconnect.
//!
//! # Delivery
//!
//! Queued messages stay queued until the peer acknowledges them. After every
//! reconnect the unacknowledged tail is replayed in order and the receiver
//! drops anything at or below its highest delivered sequence number.

/// Connection driver task and manager handle
pub(crate) mod core;

/// Error types specific to peer operations
pub mod error;

/// Hello exchange and frame I/O
pub(crate) mod handshake;

/// Counters and connection timestamps
pub mod metrics;

/// Queue, counters and bindings for one peer
pub(crate) mod record;

/// Connection state machine
pub mod state;

pub(crate) use self::core::{PeerCommand, PeerContext, PeerHandle};
pub use error::{PeerError, PeerResult};
pub use metrics::PeerMetrics;
pub use record::PeerSnapshot;
pub use state::PeerState;
