//! Kernel-facing callbacks and outbound message type.

use async_trait::async_trait;
use ocap_core::{IncarnationId, PeerId};
use serde::{Deserialize, Serialize};

use crate::RemoteError;

/// Identifier of a kernel promise awaiting a remote reply.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromiseId(String);

impl PromiseId {
    /// Wrap a kernel promise reference.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PromiseId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl std::fmt::Display for PromiseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed to `send_remote_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Opaque payload.
    pub payload: Vec<u8>,
    /// Promise settled by the remote's reply, if one is expected.
    pub promise: Option<PromiseId>,
}

impl OutboundMessage {
    /// A one-way message.
    pub fn notify(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            promise: None,
        }
    }

    /// A message whose reply settles `promise`.
    pub fn expecting_reply(payload: impl Into<Vec<u8>>, promise: PromiseId) -> Self {
        Self {
            payload: payload.into(),
            promise: Some(promise),
        }
    }
}

/// Callbacks from the transport into the kernel.
///
/// The transport never holds internal borrows while calling these, so a
/// handler may call back into the manager (for example to send a follow-up
/// message).
#[async_trait(?Send)]
pub trait RemoteHandler {
    /// Handle a new, de-duplicated inbound message.
    ///
    /// A returned reply is sent back to `from` and settles the sender's
    /// promise. Replies to messages that expected none are discarded.
    async fn handle_message(&self, from: &PeerId, payload: &[u8]) -> Option<Vec<u8>>;

    /// Settle a promise bound to a remote reply.
    fn resolve_promise(&self, promise: &PromiseId, result: Result<Vec<u8>, RemoteError>);

    /// The transport gave up on `peer` after exhausting its retries.
    fn on_give_up(&self, peer: &PeerId) {
        let _ = peer;
    }

    /// `peer` restarted: a handshake carried a new incarnation.
    fn on_incarnation_change(&self, peer: &PeerId, incarnation: IncarnationId) {
        let _ = (peer, incarnation);
    }
}
