//! In-process network for tests and embedding.
//!
//! [`MemoryNetwork`] is a [`Dialer`] whose listeners live in a shared registry
//! keyed by `/memory/<name>` addresses. Each dial produces one half of a
//! `tokio::io::duplex` pipe and hands the other half to the listener.
//! Dropping a listener unregisters its address, after which dials to it fail
//! with `ConnectionRefused`, which is how tests take a peer offline.

use async_trait::async_trait;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use tokio::io::DuplexStream;
use tokio::sync::{Mutex, mpsc};

use crate::{
    ChaChaRandomProvider, Dialer, Listener, PeerAddress, Providers, TokioTaskProvider,
    TokioTimeProvider, TransportKind,
};

/// Buffer size of each direction of a memory connection.
const PIPE_CAPACITY: usize = 64 * 1024;

type Incoming = (DuplexStream, String);

#[derive(Default)]
struct Registry {
    listeners: HashMap<String, (u64, mpsc::UnboundedSender<Incoming>)>,
    next_listener: u64,
    next_client: u64,
}

/// Shared in-memory network.
///
/// Clones share the same registry, so every manager in a test should be given
/// a clone of one network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    registry: Rc<RefCell<Registry>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a listener is currently bound at `addr`.
    pub fn is_bound(&self, addr: &str) -> bool {
        let key = Self::key(addr);
        self.registry
            .borrow()
            .listeners
            .get(&key)
            .is_some_and(|(_, tx)| !tx.is_closed())
    }

    fn key(addr: &str) -> String {
        PeerAddress::parse(addr)
            .map(|a| a.transport_part().to_string())
            .unwrap_or_else(|| addr.to_string())
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.borrow();
        f.debug_struct("MemoryNetwork")
            .field("listeners", &registry.listeners.len())
            .finish()
    }
}

#[async_trait(?Send)]
impl Dialer for MemoryNetwork {
    type Stream = DuplexStream;
    type Listener = MemoryListener;

    async fn listen(&self, addr: &str) -> io::Result<Self::Listener> {
        if TransportKind::classify(addr) != Some(TransportKind::Memory) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a memory address: {}", addr),
            ));
        }
        let key = Self::key(addr);
        let mut registry = self.registry.borrow_mut();
        if let Some((_, tx)) = registry.listeners.get(&key)
            && !tx.is_closed()
        {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("address already bound: {}", key),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        registry.next_listener += 1;
        let id = registry.next_listener;
        registry.listeners.insert(key.clone(), (id, tx));
        tracing::debug!(addr = %key, "memory listener bound");

        Ok(MemoryListener {
            registry: self.registry.clone(),
            addr: key,
            id,
            incoming: Mutex::new(rx),
        })
    }

    async fn dial(&self, addr: &PeerAddress) -> io::Result<Self::Stream> {
        if addr.kind() != TransportKind::Memory {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{} transport not available: {}", addr.kind(), addr),
            ));
        }
        let mut registry = self.registry.borrow_mut();
        registry.next_client += 1;
        let client_addr = format!("/memory/client-{}", registry.next_client);

        let refused = || {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no listener at {}", addr.transport_part()),
            )
        };
        let (_, tx) = registry
            .listeners
            .get(addr.transport_part())
            .ok_or_else(refused)?;

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        tx.send((server, client_addr)).map_err(|_| refused())?;
        Ok(client)
    }
}

/// Listener bound on a [`MemoryNetwork`].
pub struct MemoryListener {
    registry: Rc<RefCell<Registry>>,
    addr: String,
    id: u64,
    incoming: Mutex<mpsc::UnboundedReceiver<Incoming>>,
}

#[async_trait(?Send)]
impl Listener for MemoryListener {
    type Stream = DuplexStream;

    async fn accept(&self) -> io::Result<(Self::Stream, String)> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "memory listener unregistered")
        })
    }

    fn local_addr(&self) -> io::Result<String> {
        Ok(self.addr.clone())
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        let mut registry = self.registry.borrow_mut();
        if registry
            .listeners
            .get(&self.addr)
            .is_some_and(|(id, _)| *id == self.id)
        {
            registry.listeners.remove(&self.addr);
            tracing::debug!(addr = %self.addr, "memory listener unbound");
        }
    }
}

/// Provider bundle wired to a [`MemoryNetwork`] and a seeded RNG.
#[derive(Clone)]
pub struct MemoryProviders {
    network: MemoryNetwork,
    time: TokioTimeProvider,
    task: TokioTaskProvider,
    random: ChaChaRandomProvider,
}

impl MemoryProviders {
    /// Bundle `network` with a ChaCha RNG seeded by `seed`.
    pub fn new(network: MemoryNetwork, seed: u64) -> Self {
        Self {
            network,
            time: TokioTimeProvider::new(),
            task: TokioTaskProvider,
            random: ChaChaRandomProvider::new(seed),
        }
    }
}

impl Providers for MemoryProviders {
    type Dialer = MemoryNetwork;
    type Time = TokioTimeProvider;
    type Task = TokioTaskProvider;
    type Random = ChaChaRandomProvider;

    fn dialer(&self) -> &Self::Dialer {
        &self.network
    }

    fn time(&self) -> &Self::Time {
        &self.time
    }

    fn task(&self) -> &Self::Task {
        &self.task
    }

    fn random(&self) -> &Self::Random {
        &self.random
    }
}
