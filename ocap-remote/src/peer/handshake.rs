//! Connection handshake and frame I/O helpers.
//!
//! The dialing side writes its `hello` first and then reads the acceptor's.
//! The accepting side reads first, decides whether to admit the peer, and
//! answers with its own `hello`. Each side's `hello` carries an ack for the
//! other side's messages, valid only for the incarnation it names.

use std::rc::Rc;

use ocap_core::{Dialer, PeerAddress, PeerId, Providers, TimeProvider};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::PeerContext;
use super::error::{PeerError, PeerResult};
use super::record::PeerRecord;
use crate::wire::{Envelope, Hello, MessageBody, encode_frame, try_decode_frame};

/// Size of each socket read.
pub(crate) const READ_CHUNK: usize = 4096;

/// Stream type produced by a provider bundle's dialer.
pub(crate) type StreamOf<P> = <<P as Providers>::Dialer as Dialer>::Stream;

/// A connection that completed the handshake.
pub(crate) struct Handshaked<S> {
    pub stream: S,
    /// The remote side's hello.
    pub hello: Hello,
    /// Bytes read past the remote hello.
    pub read_buffer: Vec<u8>,
    /// Peer that opened the connection.
    pub initiator: PeerId,
}

/// Our hello for `record`'s peer.
pub(crate) fn local_hello<P: Providers>(ctx: &PeerContext<P>, record: &PeerRecord) -> Hello {
    Hello {
        peer_id: ctx.local_id.clone(),
        incarnation: ctx.incarnation,
        ack: record.acks.received_seq(),
        acked_incarnation: record.incarnation.current(),
    }
}

/// Read exactly one envelope, leaving any extra bytes in `buffer`.
pub(crate) async fn read_envelope<S>(stream: &mut S, buffer: &mut Vec<u8>) -> PeerResult<Envelope>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some((envelope, consumed)) = try_decode_frame(buffer)? {
            buffer.drain(..consumed);
            return Ok(envelope);
        }
        let mut chunk = [0u8; READ_CHUNK];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(PeerError::ConnectionLost);
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

/// Write pre-encoded frames and flush.
pub(crate) async fn write_frames<S>(stream: &mut S, frames: &[Vec<u8>]) -> PeerResult<()>
where
    S: AsyncWrite + Unpin,
{
    for frame in frames {
        stream.write_all(frame).await?;
    }
    stream.flush().await?;
    Ok(())
}

/// Read the remote hello.
pub(crate) async fn read_hello<S>(stream: &mut S, buffer: &mut Vec<u8>) -> PeerResult<Hello>
where
    S: AsyncRead + Unpin,
{
    let envelope = read_envelope(stream, buffer).await?;
    match envelope.body()? {
        Some(MessageBody::Hello(hello)) => Ok(hello),
        _ => Err(PeerError::HandshakeFailure(format!(
            "expected hello, got {}",
            envelope.method
        ))),
    }
}

/// Send our hello.
pub(crate) async fn write_hello<S>(stream: &mut S, hello: &Hello) -> PeerResult<()>
where
    S: AsyncWrite + Unpin,
{
    let frame = encode_frame(&MessageBody::Hello(hello.clone()).to_envelope(0, hello.ack)?)?;
    write_frames(stream, &[frame]).await
}

/// Dial `peer` through each candidate address in turn until one handshakes.
///
/// Each candidate gets its own `dial_timeout`. The error of the last
/// candidate is returned when all fail.
pub(crate) async fn dial_peer<P: Providers>(
    ctx: Rc<PeerContext<P>>,
    peer: PeerId,
    candidates: Vec<PeerAddress>,
    hello: Hello,
) -> PeerResult<Handshaked<StreamOf<P>>> {
    let mut last_error = PeerError::NoAddresses;
    for addr in candidates {
        let attempt = connect_and_greet(&ctx, &peer, &addr, &hello);
        match ctx
            .providers
            .time()
            .timeout(ctx.options.dial_timeout, attempt)
            .await
        {
            Ok(Ok(handshaked)) => return Ok(handshaked),
            Ok(Err(error)) => {
                tracing::debug!(peer = %peer.short(), %addr, %error, "dial attempt failed");
                last_error = error;
            }
            Err(_) => {
                tracing::debug!(peer = %peer.short(), %addr, "dial attempt timed out");
                last_error = PeerError::DialTimeout;
            }
        }
    }
    Err(last_error)
}

async fn connect_and_greet<P: Providers>(
    ctx: &PeerContext<P>,
    peer: &PeerId,
    addr: &PeerAddress,
    hello: &Hello,
) -> PeerResult<Handshaked<StreamOf<P>>> {
    let mut stream = ctx.providers.dialer().dial(addr).await?;
    write_hello(&mut stream, hello).await?;

    let mut read_buffer = Vec::new();
    let remote = read_hello(&mut stream, &mut read_buffer).await?;
    if remote.peer_id != *peer {
        return Err(PeerError::HandshakeFailure(format!(
            "dialed {} but reached {}",
            peer.short(),
            remote.peer_id.short()
        )));
    }

    Ok(Handshaked {
        stream,
        hello: remote,
        read_buffer,
        initiator: ctx.local_id.clone(),
    })
}
