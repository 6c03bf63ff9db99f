//! Dialer abstraction over concrete wire transports.
//!
//! The reliability layer never opens sockets itself. It asks a [`Dialer`] to
//! turn a classified [`PeerAddress`] into a byte stream, and to bind listeners
//! for its own direct-listen addresses. Swapping the dialer swaps the transport
//! stack (Tokio TCP in production, [`crate::memory::MemoryNetwork`] in tests).

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{PeerAddress, TransportKind};

/// Provider trait for creating connections and listeners.
///
/// Single-core design - no Send bounds needed.
/// Clone allows sharing the dialer across every peer connection.
#[async_trait(?Send)]
pub trait Dialer: Clone {
    /// The byte stream type for this dialer.
    type Stream: AsyncRead + AsyncWrite + Unpin + 'static;
    /// The listener type for this dialer.
    type Listener: Listener<Stream = Self::Stream> + 'static;

    /// Bind a listener on a direct-listen address.
    async fn listen(&self, addr: &str) -> io::Result<Self::Listener>;

    /// Open a connection to a peer address.
    ///
    /// Implementations return [`io::ErrorKind::Unsupported`] for transport
    /// kinds they cannot route.
    async fn dial(&self, addr: &PeerAddress) -> io::Result<Self::Stream>;
}

/// Trait for listeners that accept inbound connections.
#[async_trait(?Send)]
pub trait Listener {
    /// The stream type that this listener produces.
    type Stream: AsyncRead + AsyncWrite + Unpin + 'static;

    /// Accept a single incoming connection, with the remote's address.
    async fn accept(&self) -> io::Result<(Self::Stream, String)>;

    /// Dialable address this listener is bound to, in multiaddress form.
    fn local_addr(&self) -> io::Result<String>;
}

/// Tokio TCP dialer.
///
/// Handles `/ip4|ip6|dns*/<host>/tcp/<port>` addresses. QUIC, relay circuits and
/// memory addresses are reported as unsupported.
#[derive(Debug, Clone, Default)]
pub struct TokioDialer;

impl TokioDialer {
    /// Create a new Tokio dialer.
    pub fn new() -> Self {
        Self
    }
}

fn unsupported(addr: &PeerAddress) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{} transport not available: {}", addr.kind(), addr),
    )
}

#[async_trait(?Send)]
impl Dialer for TokioDialer {
    type Stream = tokio::net::TcpStream;
    type Listener = TokioListener;

    async fn listen(&self, addr: &str) -> io::Result<Self::Listener> {
        let parsed = PeerAddress::parse(addr)
            .filter(|a| a.kind() == TransportKind::Tcp)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("not a TCP listen address: {}", addr),
                )
            })?;
        let socket_addr = parsed.tcp_socket_addr().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("malformed TCP address: {}", addr),
            )
        })?;
        let listener = tokio::net::TcpListener::bind(socket_addr).await?;
        Ok(TokioListener { inner: listener })
    }

    async fn dial(&self, addr: &PeerAddress) -> io::Result<Self::Stream> {
        if addr.kind() != TransportKind::Tcp {
            return Err(unsupported(addr));
        }
        let socket_addr = addr.tcp_socket_addr().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("malformed TCP address: {}", addr),
            )
        })?;
        let stream = tokio::net::TcpStream::connect(socket_addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Wrapper for Tokio TcpListener to implement [`Listener`].
#[derive(Debug)]
pub struct TokioListener {
    inner: tokio::net::TcpListener,
}

#[async_trait(?Send)]
impl Listener for TokioListener {
    type Stream = tokio::net::TcpStream;

    async fn accept(&self) -> io::Result<(Self::Stream, String)> {
        let (stream, addr) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, addr.to_string()))
    }

    fn local_addr(&self) -> io::Result<String> {
        let addr = self.inner.local_addr()?;
        let proto = if addr.is_ipv4() { "ip4" } else { "ip6" };
        Ok(format!("/{}/{}/tcp/{}", proto, addr.ip(), addr.port()))
    }
}
