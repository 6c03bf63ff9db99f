//! Kernel-facing entry point of the remote transport.
//!
//! [`RemoteTransportManager`] owns the lifecycle (`Uninitialized`, `Active`,
//! `Stopped`), the peer table, and the listener accept loops. Peer state
//! itself lives in each peer's record and is driven by that peer's task.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use ocap_core::{
    Dialer, IncarnationId, Listener, PeerId, Providers, TaskProvider, TimeProvider,
};
use tokio::task::JoinHandle;

use crate::handler::{OutboundMessage, RemoteHandler};
use crate::peer::handshake::{Handshaked, local_hello, read_hello, write_hello};
use crate::peer::{
    PeerCommand, PeerContext, PeerError, PeerHandle, PeerResult, PeerSnapshot, PeerState,
};
use crate::wire::MAX_MESSAGE_SIZE;
use crate::{BackoffScheduler, RemoteCommsOptions, RemoteError, RemoteResult};

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

type PeerTable<P> = HashMap<PeerId, PeerHandle<P>>;

enum CommsState<P: Providers> {
    Uninitialized,
    Active(ActiveComms<P>),
    Stopped,
}

struct ActiveComms<P: Providers> {
    ctx: Rc<PeerContext<P>>,
    peers: Rc<RefCell<PeerTable<P>>>,
    listen_addresses: Vec<String>,
    accept_tasks: Vec<JoinHandle<()>>,
}

impl<P: Providers> ActiveComms<P> {
    /// The handle for `peer`, spawning its driver on first reference.
    fn with_peer<R>(&self, peer: &PeerId, f: impl FnOnce(&PeerHandle<P>) -> R) -> R {
        let mut peers = self.peers.borrow_mut();
        let handle = peers
            .entry(peer.clone())
            .or_insert_with(|| PeerHandle::spawn(&self.ctx, peer.clone()));
        f(handle)
    }
}

/// Reliable message transport between kernels.
///
/// Must be used from inside a `tokio::task::LocalSet`: every peer runs as a
/// local task.
///
/// # Example
///
/// ```ignore
/// let manager = RemoteTransportManager::new(TokioProviders::new(), handler);
/// manager
///     .initialize_remote_comms(&seed, RemoteCommsOptions::default().with_listen_address("/ip4/0.0.0.0/tcp/4001"))
///     .await?;
/// manager.register_location_hints(&bob, ["/ip4/10.0.0.2/tcp/4001".to_string()])?;
/// manager.send_remote_message(&bob, OutboundMessage::expecting_reply(b"hi".to_vec(), "kp1".into()))?;
/// ```
pub struct RemoteTransportManager<P: Providers> {
    providers: P,
    handler: Rc<dyn RemoteHandler>,
    state: RefCell<CommsState<P>>,
}

impl<P: Providers> RemoteTransportManager<P> {
    /// Create a manager. Nothing is bound until `initialize_remote_comms`.
    pub fn new(providers: P, handler: Rc<dyn RemoteHandler>) -> Self {
        Self {
            providers,
            handler,
            state: RefCell::new(CommsState::Uninitialized),
        }
    }

    /// Whether comms are active.
    pub fn is_initialized(&self) -> bool {
        matches!(*self.state.borrow(), CommsState::Active(_))
    }

    /// Derive the local identity, bind listeners and start accepting peers.
    ///
    /// Fails with [`RemoteError::AlreadyInitialized`] unless the manager is new
    /// or was stopped.
    pub async fn initialize_remote_comms(
        &self,
        identity_seed: &[u8],
        options: RemoteCommsOptions,
    ) -> RemoteResult<()> {
        if self.is_initialized() {
            return Err(RemoteError::AlreadyInitialized);
        }
        options.validate()?;
        let local_id =
            PeerId::from_seed(identity_seed).map_err(|_| RemoteError::InvalidIdentitySeed)?;
        let incarnation = IncarnationId::random(self.providers.random());

        let mut listeners = Vec::with_capacity(options.direct_listen_addresses.len());
        let mut listen_addresses = Vec::new();
        for addr in &options.direct_listen_addresses {
            let listener = self
                .providers
                .dialer()
                .listen(addr)
                .await
                .map_err(|e| RemoteError::Listen {
                    address: addr.clone(),
                    message: e.to_string(),
                })?;
            let bound = listener.local_addr().map_err(|e| RemoteError::Listen {
                address: addr.clone(),
                message: e.to_string(),
            })?;
            listen_addresses.push(format!("{bound}/p2p/{local_id}"));
            listeners.push(listener);
        }
        for relay in &options.relays {
            listen_addresses.push(format!("{relay}/p2p-circuit/p2p/{local_id}"));
        }

        // A concurrent initialize may have won while listeners were binding.
        if self.is_initialized() {
            return Err(RemoteError::AlreadyInitialized);
        }

        let ctx = Rc::new(PeerContext {
            local_id: local_id.clone(),
            incarnation,
            backoff: BackoffScheduler::new(&options.backoff),
            options,
            handler: self.handler.clone(),
            providers: self.providers.clone(),
        });
        let peers = Rc::new(RefCell::new(PeerTable::new()));

        let accept_tasks = listeners
            .into_iter()
            .enumerate()
            .map(|(i, listener)| {
                self.providers.task().spawn_task(
                    &format!("accept-{i}"),
                    accept_loop(listener, ctx.clone(), peers.clone()),
                )
            })
            .collect();

        tracing::info!(
            peer = %local_id.short(),
            %incarnation,
            listen = ?listen_addresses,
            "remote comms initialized"
        );

        *self.state.borrow_mut() = CommsState::Active(ActiveComms {
            ctx,
            peers,
            listen_addresses,
            accept_tasks,
        });
        Ok(())
    }

    fn with_active<R>(&self, f: impl FnOnce(&ActiveComms<P>) -> RemoteResult<R>) -> RemoteResult<R> {
        match &*self.state.borrow() {
            CommsState::Active(active) => f(active),
            CommsState::Uninitialized | CommsState::Stopped => Err(RemoteError::NotInitialized),
        }
    }

    /// Queue a message for `peer` and wake its connection.
    ///
    /// Returns once the message is queued; delivery happens in the background.
    pub fn send_remote_message(
        &self,
        peer: &PeerId,
        message: OutboundMessage,
    ) -> RemoteResult<()> {
        if message.payload.len() > MAX_MESSAGE_SIZE {
            return Err(RemoteError::MessageTooLarge {
                size: message.payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        self.with_active(|active| {
            let now = active.ctx.providers.time().now();
            active.with_peer(peer, |handle| {
                let seq = {
                    let mut record = handle.record.borrow_mut();
                    if record.state() == PeerState::IntentionallyClosed {
                        return Err(RemoteError::IntentionalCloseBlocksDelivery {
                            peer: peer.clone(),
                        });
                    }
                    record
                        .enqueue_message(message, now)
                        .map_err(|full| RemoteError::QueueAtCapacity {
                            peer: peer.clone(),
                            capacity: full.capacity,
                        })?
                };
                tracing::debug!(peer = %peer.short(), seq, "message queued");
                handle.data_to_send.notify_one();
                Ok(())
            })
        })
    }

    /// Merge location hints for `peer` without dialing.
    ///
    /// Returns how many hints were recognized.
    pub fn register_location_hints<I>(&self, peer: &PeerId, hints: I) -> RemoteResult<usize>
    where
        I: IntoIterator<Item = String>,
    {
        self.with_active(|active| {
            Ok(active.with_peer(peer, |handle| handle.record.borrow_mut().add_hints(hints)))
        })
    }

    /// Clear an intentional close, merge `hints` and dial `peer` now.
    ///
    /// A live connection is dropped and redialed.
    pub fn reconnect_peer(&self, peer: &PeerId, hints: Option<Vec<String>>) -> RemoteResult<()> {
        self.with_active(|active| {
            active.with_peer(peer, |handle| {
                {
                    let mut record = handle.record.borrow_mut();
                    if let Some(hints) = hints {
                        record.add_hints(hints);
                    }
                    record.attempt = 0;
                    if let Err(error) = record.transition(PeerState::Connecting) {
                        tracing::debug!(peer = %peer.short(), %error, "reconnect from unexpected state");
                    }
                }
                tracing::info!(peer = %peer.short(), "reconnecting peer");
                handle.send(PeerCommand::Reconnect);
            });
            Ok(())
        })
    }

    /// Close the connection to `peer` on purpose.
    ///
    /// Queued messages and promise bindings are kept for a later
    /// [`reconnect_peer`](Self::reconnect_peer); new sends fail until then.
    pub fn close_connection(&self, peer: &PeerId) -> RemoteResult<()> {
        self.with_active(|active| {
            active.with_peer(peer, |handle| {
                if let Err(error) = handle
                    .record
                    .borrow_mut()
                    .transition(PeerState::IntentionallyClosed)
                {
                    tracing::debug!(peer = %peer.short(), %error, "close ignored");
                }
                handle.send(PeerCommand::Close);
            });
            Ok(())
        })
    }

    /// Zero every peer's attempt counter and cut pending backoffs short.
    pub fn reset_all_backoffs(&self) -> RemoteResult<()> {
        self.with_active(|active| {
            for handle in active.peers.borrow().values() {
                handle.record.borrow_mut().attempt = 0;
                handle.send(PeerCommand::ResetBackoff);
            }
            Ok(())
        })
    }

    /// Tear down every peer and listener. A no-op unless active.
    ///
    /// Unsettled promise bindings are dropped; the kernel owns their fate.
    pub async fn stop_remote_comms(&self) {
        let active = {
            let mut state = self.state.borrow_mut();
            match std::mem::replace(&mut *state, CommsState::Stopped) {
                CommsState::Active(active) => active,
                other => {
                    *state = other;
                    return;
                }
            }
        };

        for task in &active.accept_tasks {
            task.abort();
        }
        for task in active.accept_tasks {
            let _ = task.await;
        }

        let handles: Vec<(PeerId, PeerHandle<P>)> = active.peers.borrow_mut().drain().collect();
        let mut dropped_bindings = 0;
        for (_, mut handle) in handles {
            handle.shutdown().await;
            dropped_bindings += handle.record.borrow().pending_bindings();
        }
        if dropped_bindings > 0 {
            tracing::warn!(dropped_bindings, "remote comms stopped with unsettled promises");
        }
        tracing::info!(peer = %active.ctx.local_id.short(), "remote comms stopped");
    }

    /// Own dialable addresses. Empty unless active.
    pub fn get_listen_addresses(&self) -> Vec<String> {
        match &*self.state.borrow() {
            CommsState::Active(active) => active.listen_addresses.clone(),
            _ => Vec::new(),
        }
    }

    /// Local peer id, once initialized.
    pub fn local_peer_id(&self) -> Option<PeerId> {
        match &*self.state.borrow() {
            CommsState::Active(active) => Some(active.ctx.local_id.clone()),
            _ => None,
        }
    }

    /// Current view of a known peer.
    pub fn peer_snapshot(&self, peer: &PeerId) -> Option<PeerSnapshot> {
        match &*self.state.borrow() {
            CommsState::Active(active) => active
                .peers
                .borrow()
                .get(peer)
                .map(|handle| handle.record.borrow().snapshot()),
            _ => None,
        }
    }
}

impl<P: Providers> Drop for RemoteTransportManager<P> {
    fn drop(&mut self) {
        if let CommsState::Active(active) = &*self.state.borrow() {
            for task in &active.accept_tasks {
                task.abort();
            }
            for handle in active.peers.borrow().values() {
                handle.send(PeerCommand::Shutdown);
            }
        }
    }
}

/// Inbound handshakes in flight for one listener. Dropped with the accept
/// loop, which cancels them.
#[derive(Default)]
struct PendingHandshakes(Vec<JoinHandle<()>>);

impl PendingHandshakes {
    fn push(&mut self, task: JoinHandle<()>) {
        self.0.retain(|task| !task.is_finished());
        self.0.push(task);
    }
}

impl Drop for PendingHandshakes {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

async fn accept_loop<P: Providers>(
    listener: <P::Dialer as Dialer>::Listener,
    ctx: Rc<PeerContext<P>>,
    peers: Rc<RefCell<PeerTable<P>>>,
) {
    let mut handshakes = PendingHandshakes::default();
    loop {
        match listener.accept().await {
            Ok((stream, remote_addr)) => {
                tracing::debug!(%remote_addr, "inbound connection");
                let ctx_clone = ctx.clone();
                let peers_clone = peers.clone();
                let task = ctx.providers.task().spawn_task(
                    &format!("handshake-{remote_addr}"),
                    async move {
                        if let Err(error) = admit_inbound(&ctx_clone, &peers_clone, stream).await {
                            tracing::warn!(%remote_addr, %error, "inbound handshake failed");
                        }
                    },
                );
                handshakes.push(task);
            }
            Err(error) if error.kind() == io::ErrorKind::BrokenPipe => {
                tracing::debug!("listener closed");
                break;
            }
            Err(error) => {
                tracing::warn!(%error, "accept failed");
                let _ = ctx.providers.time().sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Run the accepting side of the handshake and hand the stream to the peer's driver.
async fn admit_inbound<P: Providers>(
    ctx: &Rc<PeerContext<P>>,
    peers: &Rc<RefCell<PeerTable<P>>>,
    mut stream: <P::Dialer as Dialer>::Stream,
) -> PeerResult<()> {
    let mut read_buffer = Vec::new();
    let hello = ctx
        .providers
        .time()
        .timeout(ctx.options.dial_timeout, read_hello(&mut stream, &mut read_buffer))
        .await
        .map_err(|_| PeerError::DialTimeout)??;

    let peer = hello.peer_id.clone();
    if peer == ctx.local_id {
        return Err(PeerError::HandshakeFailure("connection from self".to_string()));
    }

    let ours = {
        let mut table = peers.borrow_mut();
        let handle = table
            .entry(peer.clone())
            .or_insert_with(|| PeerHandle::spawn(ctx, peer.clone()));
        let record = handle.record.borrow();
        if record.state() == PeerState::IntentionallyClosed {
            return Err(PeerError::HandshakeFailure(format!(
                "peer {} is intentionally closed",
                peer.short()
            )));
        }
        local_hello(ctx, &record)
    };

    ctx.providers
        .time()
        .timeout(ctx.options.dial_timeout, write_hello(&mut stream, &ours))
        .await
        .map_err(|_| PeerError::DialTimeout)??;

    if let Some(handle) = peers.borrow().get(&peer) {
        handle.send(PeerCommand::Attach(Handshaked {
            stream,
            hello,
            read_buffer,
            initiator: peer.clone(),
        }));
    }
    Ok(())
}
