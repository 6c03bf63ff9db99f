//! Shared harness for transport integration tests.
//!
//! Kernels run on one [`MemoryNetwork`] inside a `LocalSet` with Tokio's clock
//! paused, so backoff delays elapse instantly but in order.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use ocap_core::memory::{MemoryNetwork, MemoryProviders};
use ocap_remote::{
    IncarnationId, OutboundMessage, PeerId, PeerSnapshot, PromiseId, RemoteCommsOptions,
    RemoteError, RemoteHandler, RemoteTransportManager,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}

/// Handler that records every callback and optionally answers messages.
#[derive(Default)]
pub struct RecordingHandler {
    reply_prefix: Option<Vec<u8>>,
    pub received: RefCell<Vec<(PeerId, Vec<u8>)>>,
    pub settled: RefCell<Vec<(PromiseId, Result<Vec<u8>, RemoteError>)>>,
    pub give_ups: RefCell<Vec<PeerId>>,
    pub incarnations: RefCell<Vec<(PeerId, IncarnationId)>>,
}

impl RecordingHandler {
    /// A handler that never replies.
    pub fn silent() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// A handler that replies with `prefix` followed by the payload.
    pub fn echo(prefix: &[u8]) -> Rc<Self> {
        Rc::new(Self {
            reply_prefix: Some(prefix.to_vec()),
            ..Self::default()
        })
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.received.borrow().iter().map(|(_, p)| p.clone()).collect()
    }

    pub fn settled_count(&self) -> usize {
        self.settled.borrow().len()
    }
}

#[async_trait(?Send)]
impl RemoteHandler for RecordingHandler {
    async fn handle_message(&self, from: &PeerId, payload: &[u8]) -> Option<Vec<u8>> {
        self.received
            .borrow_mut()
            .push((from.clone(), payload.to_vec()));
        self.reply_prefix.as_ref().map(|prefix| {
            let mut reply = prefix.clone();
            reply.extend_from_slice(payload);
            reply
        })
    }

    fn resolve_promise(&self, promise: &PromiseId, result: Result<Vec<u8>, RemoteError>) {
        self.settled.borrow_mut().push((promise.clone(), result));
    }

    fn on_give_up(&self, peer: &PeerId) {
        self.give_ups.borrow_mut().push(peer.clone());
    }

    fn on_incarnation_change(&self, peer: &PeerId, incarnation: IncarnationId) {
        self.incarnations
            .borrow_mut()
            .push((peer.clone(), incarnation));
    }
}

/// One kernel's transport and handler.
pub struct Kernel {
    pub manager: RemoteTransportManager<MemoryProviders>,
    pub handler: Rc<RecordingHandler>,
    pub id: PeerId,
}

impl Kernel {
    /// Dialable address of a kernel named `name`.
    pub fn address_of(name: &str) -> String {
        format!("/memory/{name}/p2p/{}", peer_id(name))
    }

    pub fn send(&self, to: &PeerId, payload: &[u8]) -> Result<(), RemoteError> {
        self.manager
            .send_remote_message(to, OutboundMessage::notify(payload.to_vec()))
    }

    pub fn request(&self, to: &PeerId, payload: &[u8], promise: &str) -> Result<(), RemoteError> {
        self.manager.send_remote_message(
            to,
            OutboundMessage::expecting_reply(payload.to_vec(), PromiseId::new(promise)),
        )
    }

    /// Teach this kernel where the kernel named `name` listens.
    pub fn learn(&self, name: &str) {
        self.manager
            .register_location_hints(&peer_id(name), [Kernel::address_of(name)])
            .expect("register hints");
    }

    pub fn snapshot(&self, peer: &PeerId) -> PeerSnapshot {
        self.manager.peer_snapshot(peer).expect("known peer")
    }
}

/// Peer id of the kernel named `name`.
pub fn peer_id(name: &str) -> PeerId {
    PeerId::from_seed(name.as_bytes()).expect("seed")
}

/// Default options for a kernel named `name`, listening on `/memory/<name>`.
pub fn options_for(name: &str) -> RemoteCommsOptions {
    RemoteCommsOptions::default().with_listen_address(format!("/memory/{name}"))
}

/// Start a kernel. `rng_seed` picks its incarnation.
pub async fn start_kernel(
    network: &MemoryNetwork,
    name: &str,
    rng_seed: u64,
    options: RemoteCommsOptions,
    handler: Rc<RecordingHandler>,
) -> Kernel {
    let providers = MemoryProviders::new(network.clone(), rng_seed);
    let manager = RemoteTransportManager::new(providers, handler.clone());
    manager
        .initialize_remote_comms(name.as_bytes(), options)
        .await
        .expect("initialize");
    Kernel {
        manager,
        handler,
        id: peer_id(name),
    }
}

/// Poll `condition` on the paused clock until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
