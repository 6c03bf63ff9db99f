//! # ocap-core
//!
//! Core abstractions for the ocap remote transport.
//!
//! This crate provides the fundamental traits and types the reliability layer
//! is written against:
//!
//! - **Provider traits**: Abstractions for time, tasks, randomness, and networking
//! - **Identity types**: [`PeerId`] derived from an identity seed, [`IncarnationId`]
//!   for one run of a kernel process
//! - **Addresses**: multiaddress-style hint classification ([`PeerAddress`])
//!
//! ## Provider Traits
//!
//! The provider traits allow the transport to run against real Tokio I/O or
//! against the in-memory network used by tests:
//!
//! - [`TimeProvider`]: Sleep, timeout, and time operations
//! - [`TaskProvider`]: Task spawning for single-threaded environments
//! - [`RandomProvider`]: Random number generation (jitter, incarnation ids)
//! - [`Dialer`]: Turns a peer address into a byte stream, binds listeners
//!
//! All providers are bundled behind [`Providers`] to keep type parameters short.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod address;
mod identity;
pub mod memory;
mod network;
mod providers;
mod random;
mod task;
mod time;

// Address exports
pub use address::{PeerAddress, TransportKind};

// Identity exports
pub use identity::{IdentityError, IncarnationId, PeerId};

// Provider trait exports
pub use network::{Dialer, Listener, TokioDialer, TokioListener};
pub use providers::{Providers, TokioProviders};
pub use random::{ChaChaRandomProvider, RandomProvider, TokioRandomProvider};
pub use task::{TaskProvider, TokioTaskProvider};
pub use time::{TimeError, TimeProvider, TokioTimeProvider};
