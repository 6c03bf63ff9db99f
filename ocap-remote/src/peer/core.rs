//! Per-peer connection driver.
//!
//! Every peer has one background task that owns its live connection (if any),
//! its in-flight dial, and its timers. The manager talks to it through a
//! command channel and a `data_to_send` notification; both sides share the
//! [`PeerRecord`] through short, non-awaiting `RefCell` borrows.
//!
//! Writes go through a separate writer task per connection, so the driver
//! keeps reading and handling commands while the remote is slow to drain.
//!
//! ```text
//!                 send / hint      dial ok
//!  Disconnected ─────────────► Connecting ───────► Connected
//!       ▲                        │    ▲              │
//!       │ give up                │    │ timer        │ read/write error
//!       └────────────────────────┤    │              ▼
//!                     dial error └──► BackingOff ◄───┘
//! ```
//!
//! Any state moves to `IntentionallyClosed` on close; only a reconnect leaves it.

use std::cell::RefCell;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::rc::Rc;
use std::time::Duration;

use ocap_core::{IncarnationId, PeerId, Providers, TaskProvider, TimeProvider};
use tokio::io::{AsyncReadExt, AsyncWrite, ReadHalf};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::PeerState;
use super::error::PeerError;
use super::handshake::{Handshaked, READ_CHUNK, StreamOf, dial_peer, local_hello, write_frames};
use super::record::PeerRecord;
use crate::handler::{PromiseId, RemoteHandler};
use crate::incarnation::IncarnationChange;
use crate::wire::{Deliver, Envelope, MessageBody, Reply, WireError, encode_frame, try_decode_frame};
use crate::{BackoffScheduler, RemoteCommsOptions, RemoteError};

type LocalBoxFuture<T> = Pin<Box<dyn Future<Output = T>>>;

/// How long a driver gets to exit after `Shutdown` before it is aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// State shared by every peer driver of one initialized manager.
pub(crate) struct PeerContext<P: Providers> {
    pub local_id: PeerId,
    pub incarnation: IncarnationId,
    pub options: RemoteCommsOptions,
    pub backoff: BackoffScheduler,
    pub handler: Rc<dyn RemoteHandler>,
    pub providers: P,
}

/// Instructions from the manager to a peer driver.
pub(crate) enum PeerCommand<S> {
    /// An inbound connection finished its handshake.
    Attach(Handshaked<S>),
    /// Drop any connection and dial now.
    Reconnect,
    /// Drop the connection and cancel timers and dials.
    Close,
    /// Dial now if waiting out a backoff.
    ResetBackoff,
    /// Exit the driver.
    Shutdown,
}

/// Manager-side handle to a peer driver.
pub(crate) struct PeerHandle<P: Providers> {
    pub record: Rc<RefCell<PeerRecord>>,
    pub data_to_send: Rc<Notify>,
    peer: PeerId,
    time: P::Time,
    commands: mpsc::UnboundedSender<PeerCommand<StreamOf<P>>>,
    task: Option<JoinHandle<()>>,
}

impl<P: Providers> PeerHandle<P> {
    /// Create the record for `peer` and spawn its driver.
    pub fn spawn(ctx: &Rc<PeerContext<P>>, peer: PeerId) -> Self {
        let record = Rc::new(RefCell::new(PeerRecord::new(
            peer.clone(),
            ctx.options.max_queue,
            ctx.options.overflow_policy,
        )));
        let data_to_send = Rc::new(Notify::new());
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let name = format!("peer-{}", peer.short());
        let driver = PeerDriver {
            ctx: ctx.clone(),
            peer: peer.clone(),
            record: record.clone(),
            data_to_send: data_to_send.clone(),
            commands: commands_rx,
            link: None,
            dial: None,
            backoff_timer: None,
            ack_timer: None,
        };
        let task = ctx.providers.task().spawn_task(&name, driver.run());

        Self {
            record,
            data_to_send,
            peer,
            time: ctx.providers.time().clone(),
            commands,
            task: Some(task),
        }
    }

    /// Deliver a command. A driver that already exited drops it.
    pub fn send(&self, command: PeerCommand<StreamOf<P>>) {
        let _ = self.commands.send(command);
    }

    /// Ask the driver to exit and wait for it, aborting it if it does not
    /// stop within [`SHUTDOWN_GRACE`].
    pub async fn shutdown(&mut self) {
        self.send(PeerCommand::Shutdown);
        let Some(mut task) = self.task.take() else {
            return;
        };
        if self.time.timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
            tracing::warn!(peer = %self.peer.short(), "peer driver did not stop, aborting");
            task.abort();
        }
    }
}

/// A connection that passed the handshake.
///
/// The read half stays with the driver; the write half belongs to a writer
/// task fed through `frames`. Dropping the link aborts the writer.
struct Link<S> {
    reader: ReadHalf<S>,
    read_buffer: Vec<u8>,
    initiator: PeerId,
    incarnation: IncarnationId,
    frames: mpsc::UnboundedSender<Vec<Vec<u8>>>,
    writer_failed: oneshot::Receiver<PeerError>,
    writer: JoinHandle<()>,
}

impl<S> Drop for Link<S> {
    fn drop(&mut self) {
        self.writer.abort();
    }
}

/// Drain batches of frames onto the wire until the link goes away.
///
/// Each frame gets `limit` to drain. The first failure is reported through
/// `failed` and ends the task.
async fn write_loop<W, T>(
    mut writer: W,
    mut batches: mpsc::UnboundedReceiver<Vec<Vec<u8>>>,
    failed: oneshot::Sender<PeerError>,
    record: Rc<RefCell<PeerRecord>>,
    time: T,
    limit: Duration,
) where
    W: AsyncWrite + Unpin,
    T: TimeProvider,
{
    while let Some(frames) = batches.recv().await {
        for frame in &frames {
            let written = time
                .timeout(limit, write_frames(&mut writer, std::slice::from_ref(frame)))
                .await
                .unwrap_or(Err(PeerError::WriteTimeout));
            if let Err(error) = written {
                let _ = failed.send(error);
                return;
            }
            record.borrow_mut().metrics.record_message_sent(frame.len());
        }
        tracing::trace!(frames = frames.len(), "frames written");
    }
}

/// Background task state for one peer.
struct PeerDriver<P: Providers> {
    ctx: Rc<PeerContext<P>>,
    peer: PeerId,
    record: Rc<RefCell<PeerRecord>>,
    data_to_send: Rc<Notify>,
    commands: mpsc::UnboundedReceiver<PeerCommand<StreamOf<P>>>,
    link: Option<Link<StreamOf<P>>>,
    dial: Option<LocalBoxFuture<Result<Handshaked<StreamOf<P>>, PeerError>>>,
    backoff_timer: Option<LocalBoxFuture<()>>,
    ack_timer: Option<LocalBoxFuture<()>>,
}

impl<P: Providers> PeerDriver<P> {
    async fn run(mut self) {
        loop {
            let notify = self.data_to_send.clone();
            let commands = &mut self.commands;
            let dial = &mut self.dial;
            let backoff_timer = &mut self.backoff_timer;
            let ack_timer = &mut self.ack_timer;
            let (reader, writer_failed) = match self.link.as_mut() {
                Some(Link {
                    reader,
                    writer_failed,
                    ..
                }) => (Some(reader), Some(writer_failed)),
                None => (None, None),
            };

            tokio::select! {
                command = commands.recv() => {
                    match command {
                        None | Some(PeerCommand::Shutdown) => break,
                        Some(command) => self.on_command(command).await,
                    }
                }

                _ = notify.notified() => {
                    self.on_data_to_send();
                }

                result = async {
                    match dial {
                        Some(dial) => dial.await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.dial = None;
                    self.on_dial_result(result).await;
                }

                _ = async {
                    match backoff_timer {
                        Some(timer) => timer.await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.backoff_timer = None;
                    if self.record.borrow().state() == PeerState::BackingOff {
                        self.start_dial();
                    }
                }

                _ = async {
                    match ack_timer {
                        Some(timer) => timer.await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.ack_timer = None;
                    self.send_ack_only();
                }

                read = async move {
                    match reader {
                        Some(reader) => {
                            let mut buffer = vec![0u8; READ_CHUNK];
                            reader.read(&mut buffer).await.map(|n| (buffer, n))
                        }
                        None => std::future::pending().await,
                    }
                } => {
                    self.on_read(read).await;
                }

                failure = async move {
                    match writer_failed {
                        Some(failed) => failed.await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.on_link_lost(failure.unwrap_or(PeerError::ConnectionLost));
                }
            }
        }
        tracing::debug!(peer = %self.peer.short(), "peer driver stopped");
    }

    async fn on_command(&mut self, command: PeerCommand<StreamOf<P>>) {
        match command {
            PeerCommand::Attach(handshaked) => self.adopt(handshaked).await,
            PeerCommand::Reconnect => {
                self.drop_link();
                self.dial = None;
                self.backoff_timer = None;
                self.start_dial();
            }
            PeerCommand::Close => {
                self.drop_link();
                self.dial = None;
                self.backoff_timer = None;
                tracing::info!(peer = %self.peer.short(), "connection closed intentionally");
            }
            PeerCommand::ResetBackoff => {
                if self.backoff_timer.take().is_some()
                    && self.record.borrow().state() == PeerState::BackingOff
                {
                    self.start_dial();
                }
            }
            PeerCommand::Shutdown => {}
        }
    }

    fn on_data_to_send(&mut self) {
        let (state, has_queued) = {
            let record = self.record.borrow();
            (record.state(), !record.queue.is_empty())
        };
        match state {
            PeerState::Connected => self.flush(),
            PeerState::Disconnected if has_queued => self.start_dial(),
            _ => {}
        }
    }

    fn start_dial(&mut self) {
        let (candidates, hello, attempt) = {
            let mut record = self.record.borrow_mut();
            if let Err(error) = record.transition(PeerState::Connecting) {
                tracing::debug!(peer = %self.peer.short(), %error, "not dialing");
                return;
            }
            record.metrics.record_connection_attempt();
            (
                record.dial_candidates(&self.ctx.options.relays),
                local_hello(&self.ctx, &record),
                record.attempt,
            )
        };
        tracing::debug!(
            peer = %self.peer.short(),
            attempt,
            candidates = candidates.len(),
            "dialing peer"
        );
        self.dial = Some(Box::pin(dial_peer(
            self.ctx.clone(),
            self.peer.clone(),
            candidates,
            hello,
        )));
    }

    async fn on_dial_result(&mut self, result: Result<Handshaked<StreamOf<P>>, PeerError>) {
        match result {
            Ok(handshaked) => self.adopt(handshaked).await,
            Err(error) => {
                let connecting = self.record.borrow().state() == PeerState::Connecting;
                if self.link.is_some() || !connecting {
                    tracing::debug!(peer = %self.peer.short(), %error, "stale dial failed");
                    return;
                }
                self.on_dial_failure(error);
            }
        }
    }

    fn on_dial_failure(&mut self, error: PeerError) {
        let now = self.ctx.providers.time().now();
        let max_attempts = self.ctx.options.max_retry_attempts;

        let outcome = {
            let mut record = self.record.borrow_mut();
            record.metrics.record_connection_failure(now);
            let delay = self
                .ctx
                .backoff
                .next_delay(record.attempt, self.ctx.providers.random());
            record.attempt = record.attempt.saturating_add(1);

            if max_attempts > 0 && record.attempt >= max_attempts {
                tracing::warn!(
                    peer = %self.peer.short(),
                    attempts = record.attempt,
                    %error,
                    "giving up on peer"
                );
                record.give_up().map(DialOutcome::GiveUp)
            } else {
                tracing::debug!(
                    peer = %self.peer.short(),
                    attempt = record.attempt,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "dial failed, backing off"
                );
                record
                    .transition(PeerState::BackingOff)
                    .map(|()| DialOutcome::Retry(delay))
            }
        };

        match outcome {
            Ok(DialOutcome::Retry(delay)) => self.arm_backoff(delay),
            Ok(DialOutcome::GiveUp(bindings)) => self.reject_bindings(bindings),
            Err(error) => tracing::warn!(peer = %self.peer.short(), %error, "dial failure ignored"),
        }
    }

    fn reject_bindings(&self, bindings: Vec<PromiseId>) {
        let handler = &self.ctx.handler;
        for promise in bindings {
            handler.resolve_promise(
                &promise,
                Err(RemoteError::RemoteConnectionLost {
                    peer: self.peer.clone(),
                }),
            );
        }
        handler.on_give_up(&self.peer);
    }

    fn arm_backoff(&mut self, delay: Duration) {
        let time = self.ctx.providers.time().clone();
        self.backoff_timer = Some(Box::pin(async move {
            let _ = time.sleep(delay).await;
        }));
    }

    async fn adopt(&mut self, handshaked: Handshaked<StreamOf<P>>) {
        if let Some(existing) = &self.link {
            let replace = incoming_wins(
                &self.ctx.local_id,
                &self.peer,
                (&existing.initiator, existing.incarnation),
                (&handshaked.initiator, handshaked.hello.incarnation),
            );
            self.record.borrow_mut().metrics.duplicate_connections += 1;
            tracing::warn!(
                peer = %self.peer.short(),
                error = %PeerError::DuplicateConnection,
                initiator = %handshaked.initiator.short(),
                replace,
                "second connection for peer"
            );
            if !replace {
                return;
            }
        }

        let Handshaked {
            stream,
            hello,
            read_buffer,
            initiator,
        } = handshaked;
        let now = self.ctx.providers.time().now();

        let restarted = {
            let mut record = self.record.borrow_mut();
            if let Err(error) = record.transition(PeerState::Connected) {
                tracing::warn!(peer = %self.peer.short(), %error, "refusing connection");
                return;
            }
            let restarted = matches!(
                record.incarnation.observe(hello.incarnation),
                IncarnationChange::Changed { .. }
            );
            if restarted {
                let stale = record.on_restart();
                if stale > 0 {
                    tracing::warn!(
                        peer = %self.peer.short(),
                        stale,
                        "peer restarted, dropped replies for its previous incarnation"
                    );
                }
            }
            if hello.acked_incarnation == Some(self.ctx.incarnation) {
                record.apply_ack(hello.ack);
            }
            record.attempt = 0;
            let replayed = record.queue.rewind();
            record.metrics.messages_retransmitted += replayed as u64;
            record.metrics.record_connection_established(now);
            tracing::info!(
                peer = %self.peer.short(),
                incarnation = %hello.incarnation,
                initiator = %initiator.short(),
                replay = replayed,
                restarted,
                "peer connected"
            );
            restarted
        };

        self.dial = None;
        self.backoff_timer = None;
        self.ack_timer = None;
        self.link = Some(self.open_link(stream, read_buffer, initiator, hello.incarnation));

        if restarted {
            self.ctx
                .handler
                .on_incarnation_change(&self.peer, hello.incarnation);
        }
        self.flush();
        self.process_buffered().await;
    }

    /// Split `stream` and start its writer task.
    fn open_link(
        &self,
        stream: StreamOf<P>,
        read_buffer: Vec<u8>,
        initiator: PeerId,
        incarnation: IncarnationId,
    ) -> Link<StreamOf<P>> {
        let (reader, writer) = tokio::io::split(stream);
        let (frames, batches) = mpsc::unbounded_channel();
        let (failed, writer_failed) = oneshot::channel();
        let writer = self.ctx.providers.task().spawn_task(
            &format!("writer-{}", self.peer.short()),
            write_loop(
                writer,
                batches,
                failed,
                self.record.clone(),
                self.ctx.providers.time().clone(),
                self.ctx.options.write_timeout,
            ),
        );
        Link {
            reader,
            read_buffer,
            initiator,
            incarnation,
            frames,
            writer_failed,
            writer,
        }
    }

    /// Drop the live connection without scheduling a retry.
    fn drop_link(&mut self) -> bool {
        self.ack_timer = None;
        let had_link = self.link.take().is_some();
        if had_link {
            self.record.borrow_mut().metrics.is_connected = false;
        }
        had_link
    }

    fn on_link_lost(&mut self, error: PeerError) {
        if !self.drop_link() {
            return;
        }
        let delay = {
            let mut record = self.record.borrow_mut();
            record.metrics.record_connection_lost();
            let delay = self
                .ctx
                .backoff
                .next_delay(record.attempt, self.ctx.providers.random());
            if let Err(error) = record.transition(PeerState::BackingOff) {
                tracing::debug!(peer = %self.peer.short(), %error, "connection dropped");
                return;
            }
            delay
        };
        tracing::warn!(
            peer = %self.peer.short(),
            %error,
            delay_ms = delay.as_millis() as u64,
            "connection lost, backing off"
        );
        self.arm_backoff(delay);
    }

    async fn on_read(&mut self, read: io::Result<(Vec<u8>, usize)>) {
        match read {
            Ok((_, 0)) => self.on_link_lost(PeerError::ConnectionLost),
            Ok((buffer, n)) => {
                if let Some(link) = self.link.as_mut() {
                    link.read_buffer.extend_from_slice(&buffer[..n]);
                }
                self.record.borrow_mut().metrics.record_bytes_received(n);
                self.process_buffered().await;
            }
            Err(error) => self.on_link_lost(error.into()),
        }
    }

    /// Handle every complete frame in the read buffer.
    async fn process_buffered(&mut self) {
        loop {
            let Some(link) = self.link.as_mut() else {
                return;
            };
            match next_frame(&mut link.read_buffer) {
                Ok(Some(envelope)) => self.on_envelope(envelope).await,
                Ok(None) => break,
                Err(error) => {
                    tracing::warn!(
                        peer = %self.peer.short(),
                        %error,
                        "wire error, tearing down connection"
                    );
                    self.on_link_lost(error.into());
                    return;
                }
            }
        }
        self.maybe_arm_ack_timer();
    }

    async fn on_envelope(&mut self, envelope: Envelope) {
        if envelope.ack > 0 {
            let retired = self.record.borrow_mut().apply_ack(envelope.ack);
            if retired > 0 {
                tracing::trace!(peer = %self.peer.short(), ack = envelope.ack, retired, "queue trimmed");
            }
        }

        let body = match envelope.body() {
            Ok(Some(body)) => body,
            Ok(None) => {
                tracing::debug!(
                    peer = %self.peer.short(),
                    method = %envelope.method,
                    "ignoring unhandled method"
                );
                if envelope.seq > 0 {
                    self.record.borrow_mut().acks.record_received(envelope.seq);
                }
                return;
            }
            Err(error) => {
                tracing::warn!(
                    peer = %self.peer.short(),
                    method = %envelope.method,
                    %error,
                    "ignoring malformed message"
                );
                return;
            }
        };

        if body.is_sequenced() && !self.accept_sequenced(envelope.seq) {
            return;
        }
        match body {
            MessageBody::Deliver(deliver) => self.on_deliver(envelope.seq, deliver).await,
            MessageBody::Reply(reply) => self.on_reply(reply),
            MessageBody::Ack => {}
            MessageBody::Hello(_) => {
                tracing::debug!(peer = %self.peer.short(), "ignoring hello on established connection");
            }
        }
    }

    /// Record an inbound sequence number. Returns `false` for duplicates.
    fn accept_sequenced(&self, seq: u64) -> bool {
        let mut record = self.record.borrow_mut();
        if record.acks.record_received(seq) {
            record.metrics.duplicates_dropped += 1;
            tracing::debug!(peer = %self.peer.short(), seq, "dropping duplicate message");
            return false;
        }
        record.metrics.record_message_received();
        true
    }

    async fn on_deliver(&mut self, seq: u64, deliver: Deliver) {
        let handler = self.ctx.handler.clone();
        let reply = handler.handle_message(&self.peer, &deliver.payload).await;

        match (reply, deliver.reply_to) {
            (Some(payload), Some(reply_to)) => {
                let now = self.ctx.providers.time().now();
                let queued = self
                    .record
                    .borrow_mut()
                    .enqueue_reply(reply_to, payload, now);
                match queued {
                    Ok(_) => self.flush(),
                    Err(full) => tracing::warn!(
                        peer = %self.peer.short(),
                        reply_to,
                        %full,
                        "dropping reply"
                    ),
                }
            }
            (Some(_), None) => {
                tracing::debug!(peer = %self.peer.short(), seq, "discarding reply to one-way message");
            }
            (None, _) => {}
        }
    }

    fn on_reply(&mut self, reply: Reply) {
        let promise = self.record.borrow_mut().take_binding(reply.reply_to);
        match promise {
            Some(promise) => self.ctx.handler.resolve_promise(&promise, Ok(reply.payload)),
            None => tracing::debug!(
                peer = %self.peer.short(),
                reply_to = reply.reply_to,
                "reply for unknown binding"
            ),
        }
    }

    /// Hand every unsent queued message to the writer, piggybacking the
    /// latest ack.
    fn flush(&mut self) {
        if self.link.is_none() {
            return;
        }
        let frames = {
            let mut record = self.record.borrow_mut();
            if record.state() != PeerState::Connected || record.queue.unsent() == 0 {
                return;
            }
            let ack = record.acks.take_ack();
            let mut frames = Vec::new();
            for message in record.queue.drain() {
                match encode_message(&message.body, message.seq, ack) {
                    Ok(frame) => frames.push(frame),
                    Err(error) => tracing::warn!(
                        peer = %self.peer.short(),
                        seq = message.seq,
                        %error,
                        "skipping unencodable message"
                    ),
                }
            }
            frames
        };
        self.ack_timer = None;
        self.write(frames);
    }

    fn send_ack_only(&mut self) {
        if self.link.is_none() {
            return;
        }
        let frame = {
            let mut record = self.record.borrow_mut();
            if !record.acks.ack_pending() {
                return;
            }
            encode_message(&MessageBody::Ack, 0, record.acks.take_ack())
        };
        match frame {
            Ok(frame) => self.write(vec![frame]),
            Err(error) => tracing::warn!(peer = %self.peer.short(), %error, "failed to encode ack"),
        }
    }

    /// Queue frames on the writer. A writer that already failed reports it
    /// through `writer_failed`.
    fn write(&self, frames: Vec<Vec<u8>>) {
        if frames.is_empty() {
            return;
        }
        if let Some(link) = &self.link
            && link.frames.send(frames).is_err()
        {
            tracing::debug!(peer = %self.peer.short(), "writer already gone");
        }
    }

    fn maybe_arm_ack_timer(&mut self) {
        if self.link.is_none() || self.ack_timer.is_some() {
            return;
        }
        if !self.record.borrow().acks.ack_pending() {
            return;
        }
        let time = self.ctx.providers.time().clone();
        let delay = self.ctx.options.ack_delay;
        self.ack_timer = Some(Box::pin(async move {
            let _ = time.sleep(delay).await;
        }));
    }
}

enum DialOutcome {
    Retry(Duration),
    GiveUp(Vec<PromiseId>),
}

/// Whether a new connection should replace the live one.
///
/// A new incarnation always wins, as does a fresh connection from the same
/// initiator. Otherwise both ends keep the connection opened by the peer with
/// the smaller id.
fn incoming_wins(
    local: &PeerId,
    remote: &PeerId,
    existing: (&PeerId, IncarnationId),
    incoming: (&PeerId, IncarnationId),
) -> bool {
    if incoming.1 != existing.1 || incoming.0 == existing.0 {
        return true;
    }
    incoming.0 == std::cmp::min(local, remote)
}

fn next_frame(buffer: &mut Vec<u8>) -> Result<Option<Envelope>, WireError> {
    Ok(try_decode_frame(buffer)?.map(|(envelope, consumed)| {
        buffer.drain(..consumed);
        envelope
    }))
}

fn encode_message(body: &MessageBody, seq: u64, ack: u64) -> Result<Vec<u8>, WireError> {
    encode_frame(&body.to_envelope(seq, ack)?)
}
