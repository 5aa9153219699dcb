//! # Connection Lifecycle Orchestration
//!
//! Purpose: Bring a freshly (re)established transport into a consistent,
//! resumed state (probe readiness, replay modal session state, rebuild
//! subscriptions, drain work accepted while offline) and shuttle bytes
//! between the transport and the pipeline engine afterwards.
//!
//! ## Design Principles
//! 1. **External Transport**: The socket is a collaborator behind the
//!    [`Transport`] trait; the connection never performs IO of its own.
//! 2. **No Hidden Timers**: A still-loading server yields an explicit retry
//!    delay; the embedder sleeps and calls [`Connection::retry_ready_check`].
//! 3. **Offline Holding Area**: Commands accepted while disconnected wait
//!    FIFO outside the pipeline and join it only once the handshake is done.
//! 4. **Asynchronous Restore Failures**: Session-restore commands that fail
//!    surface as error events instead of failing the ready transition.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::BytesMut;
use pkv_wire::{decode, encode_command, RespValue};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::command::{CancelToken, CommandOptions, Completion, Confirmation, Reply};
use crate::error::{EngineError, EngineResult};
use crate::pubsub::{PubSubKind, PubSubListener};
use crate::queue::CommandQueue;
use crate::ready::{evaluate_probe, ProbeOutcome, ReadyState};

/// Outbound half of the transport collaborator.
pub trait Transport {
    /// Hands a chunk to the transport. Returning `false` means the bytes
    /// were accepted but the caller should pause further writes until it
    /// signals writability again via [`Connection::on_writable`].
    fn write(&mut self, bytes: &[u8]) -> bool;
}

/// Signals emitted to external observers, drained with
/// [`Connection::next_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Handshake finished; session state replayed; traffic flows.
    Ready,
    /// A connection-level or asynchronous internal failure.
    Error(EngineError),
}

/// Tunables for one logical connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Maximum combined depth (pending + in-flight + held offline) enforced
    /// at admission time; `None` disables the limit.
    pub max_queue_depth: Option<usize>,
    /// Size budget handed to each pipeline flush.
    pub write_chunk_bytes: usize,
    /// Probe the server for readiness after connecting; disabling jumps
    /// straight to ready.
    pub ready_check: bool,
    /// Rebuild server-side subscriptions when entering ready.
    pub auto_resubscribe: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            max_queue_depth: None,
            write_chunk_bytes: 16 * 1024,
            ready_check: true,
            auto_resubscribe: true,
        }
    }
}

struct HeldCommand {
    encoded: Vec<u8>,
    options: CommandOptions,
    tx: oneshot::Sender<EngineResult<RespValue>>,
}

#[derive(Clone, Copy)]
enum SessionKind {
    Select(u32),
    Monitor,
}

/// A SELECT or MONITOR whose reply has not settled yet. The session state
/// is committed only on success, so a rejected command is never replayed.
struct SessionUpdate {
    kind: SessionKind,
    reply: Reply,
    tx: oneshot::Sender<EngineResult<RespValue>>,
}

/// One logical client connection: pipeline engine plus lifecycle state.
pub struct Connection<T: Transport> {
    config: ConnectionConfig,
    queue: CommandQueue,
    transport: Option<T>,
    writable: bool,
    state: ReadyState,
    inbound: BytesMut,
    offline: VecDeque<HeldCommand>,
    selected_db: Option<u32>,
    monitoring: bool,
    probe: Option<Reply>,
    retry_delay: Option<Duration>,
    internal_replies: Vec<Reply>,
    internal_confirms: Vec<Confirmation>,
    session_updates: Vec<SessionUpdate>,
    events: VecDeque<Event>,
}

impl<T: Transport> Connection<T> {
    pub fn new(config: ConnectionConfig) -> Self {
        let queue = CommandQueue::new(config.max_queue_depth);
        Connection {
            config,
            queue,
            transport: None,
            writable: false,
            state: ReadyState::Connecting,
            inbound: BytesMut::with_capacity(8 * 1024),
            offline: VecDeque::new(),
            selected_db: None,
            monitoring: false,
            probe: None,
            retry_delay: None,
            internal_replies: Vec::new(),
            internal_confirms: Vec::new(),
            session_updates: Vec::new(),
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ReadyState {
        self.state
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Pops the oldest unobserved lifecycle event, if any.
    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Delay after which the readiness probe should be retried; `Some`
    /// exactly while the server reported it is still loading.
    pub fn ready_retry_delay(&self) -> Option<Duration> {
        self.retry_delay
    }

    /// Attaches a connected transport and starts the ready handshake.
    pub fn on_connected(&mut self, transport: T) {
        debug!("transport connected");
        self.transport = Some(transport);
        self.writable = true;
        if self.config.ready_check {
            self.state = ReadyState::ReadyCheckPending;
            self.issue_probe();
        } else {
            self.enter_ready();
        }
    }

    /// Feeds raw inbound bytes from the transport.
    ///
    /// Decodes every complete reply and routes it through the engine. An
    /// error return (framing loss or reply/request desync) is fatal: the
    /// caller must tear the transport down and report it via
    /// [`Connection::on_fatal`].
    pub fn feed(&mut self, bytes: &[u8]) -> EngineResult<()> {
        self.inbound.extend_from_slice(bytes);
        loop {
            match decode(&mut self.inbound) {
                Ok(Some(reply)) => self.queue.on_reply(reply)?,
                Ok(None) => break,
                Err(err) => return Err(EngineError::Protocol(err.to_string())),
            }
        }
        self.after_replies();
        Ok(())
    }

    /// Transport signalled that writes may resume after backpressure.
    pub fn on_writable(&mut self) {
        self.writable = true;
        self.flush_pipeline();
    }

    /// Submits a command with default options.
    pub fn send(&mut self, args: &[&[u8]]) -> EngineResult<Reply> {
        self.send_with(args, CommandOptions::default())
    }

    /// Submits a command.
    ///
    /// While the connection is not ready the command is admission-checked
    /// and parked in the offline holding area; it joins the pipeline, in
    /// FIFO order, when the handshake completes.
    pub fn send_with(&mut self, args: &[&[u8]], options: CommandOptions) -> EngineResult<Reply> {
        if self.state == ReadyState::Ready {
            let reply = self.queue.enqueue_with(args, options)?;
            self.flush_pipeline();
            return Ok(reply);
        }

        self.queue.admit(self.offline.len())?;
        if options.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(EngineError::Aborted);
        }
        let mut encoded = Vec::new();
        encode_command(args, &mut encoded);
        let (tx, rx) = oneshot::channel();
        self.offline.push_back(HeldCommand {
            encoded,
            options,
            tx,
        });
        Ok(Completion::new(rx))
    }

    /// Fires `token` and aborts its command if it is still unsent, whether
    /// parked offline or pending in the pipeline.
    pub fn cancel(&mut self, token: &CancelToken) -> bool {
        token.cancel();
        if self.queue.cancel(token) {
            return true;
        }
        let held = self.offline.iter().position(|held| {
            held.options
                .cancel
                .as_ref()
                .is_some_and(|candidate| candidate.same_as(token))
        });
        match held.and_then(|index| self.offline.remove(index)) {
            Some(held) => {
                let _ = held.tx.send(Err(EngineError::Aborted));
                true
            }
            None => false,
        }
    }

    /// Selects a logical database. A successful index is replayed after
    /// reconnects; one the server rejected is not.
    pub fn select(&mut self, index: u32) -> EngineResult<Reply> {
        let text = index.to_string();
        let reply = self.send(&[b"SELECT", text.as_bytes()])?;
        Ok(self.track_session(SessionKind::Select(index), reply))
    }

    /// Enables monitor mode; once confirmed, it is replayed after
    /// reconnects, before pub/sub.
    pub fn monitor(&mut self) -> EngineResult<Reply> {
        let reply = self.send(&[b"MONITOR"])?;
        Ok(self.track_session(SessionKind::Monitor, reply))
    }

    /// Registers a listener; see [`CommandQueue::subscribe`].
    pub fn subscribe(
        &mut self,
        kind: PubSubKind,
        names: &[&[u8]],
        listener: &PubSubListener,
    ) -> Confirmation {
        let confirmation = self.queue.subscribe(kind, names, listener);
        self.flush_pipeline();
        confirmation
    }

    /// Removes a listener; see [`CommandQueue::unsubscribe`].
    pub fn unsubscribe(
        &mut self,
        kind: PubSubKind,
        names: &[&[u8]],
        listener: Option<&PubSubListener>,
    ) -> Confirmation {
        let confirmation = self.queue.unsubscribe(kind, names, listener);
        self.flush_pipeline();
        confirmation
    }

    /// Re-issues the readiness probe after a still-loading delay elapsed.
    pub fn retry_ready_check(&mut self) {
        if self.state != ReadyState::StillLoading {
            return;
        }
        self.state = ReadyState::ReadyCheckPending;
        self.retry_delay = None;
        self.issue_probe();
    }

    /// Transport dropped mid-session, reconnection expected.
    ///
    /// In-flight work is rejected (along with the unsent remainder of an
    /// interrupted chain); queued-but-unsent, non-chain-bound commands and
    /// the offline holding area survive for the next connection.
    pub fn on_disconnected(&mut self, reason: &str) {
        debug!(reason, "transport disconnected");
        let err = EngineError::ConnectionLost(reason.into());
        self.reset_transport();
        self.queue.fail_in_flight(&err);
        self.drain_internal();
        self.events.push_back(Event::Error(err));
    }

    /// Unrecoverable failure: every queued, in-flight and held command is
    /// rejected and one error event is surfaced.
    pub fn on_fatal(&mut self, err: EngineError) {
        warn!(%err, "connection failed");
        self.reset_transport();
        self.queue.fail_all(&err);
        while let Some(held) = self.offline.pop_front() {
            let _ = held.tx.send(Err(err.clone()));
        }
        self.drain_internal();
        self.events.push_back(Event::Error(err));
    }

    fn reset_transport(&mut self) {
        self.transport = None;
        self.writable = false;
        self.state = ReadyState::Connecting;
        self.probe = None;
        self.retry_delay = None;
        self.inbound.clear();
    }

    fn issue_probe(&mut self) {
        // The probe jumps the line: it must go out before anything queued.
        let reply = self.queue.enqueue_internal(&[b"INFO"], true);
        self.probe = Some(reply);

        // Only the probe itself is written before the handshake finishes.
        // Pending commands that survived a disconnect stay queued until the
        // session restore has replayed, so they never run against the wrong
        // database. A zero budget flushes exactly the line-jumping probe.
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if !self.writable {
            return;
        }
        if let Some(chunk) = self.queue.flush_chunk(0) {
            if !transport.write(&chunk) {
                self.writable = false;
            }
        }
    }

    fn after_replies(&mut self) {
        if let Some(mut probe) = self.probe.take() {
            match probe.try_result() {
                None => self.probe = Some(probe),
                Some(result) => match evaluate_probe(&result) {
                    ProbeOutcome::Ready => self.enter_ready(),
                    ProbeOutcome::RetryAfter(delay) => {
                        debug!(?delay, "server still loading, probing again later");
                        self.state = ReadyState::StillLoading;
                        self.retry_delay = Some(delay);
                    }
                    ProbeOutcome::Fatal(err) => {
                        warn!(%err, "ready check failed");
                        self.events.push_back(Event::Error(err));
                    }
                },
            }
        }
        self.drain_internal();
        self.flush_pipeline();
    }

    fn enter_ready(&mut self) {
        self.state = ReadyState::Ready;
        self.retry_delay = None;

        // Replay modal session state in fixed order: SELECT, then MONITOR,
        // then pub/sub. Both jump the line, so they are issued in reverse.
        if self.monitoring {
            let reply = self.queue.enqueue_internal(&[b"MONITOR"], true);
            self.internal_replies.push(reply);
        }
        if let Some(index) = self.selected_db {
            let text = index.to_string();
            let reply = self.queue.enqueue_internal(&[b"SELECT", text.as_bytes()], true);
            self.internal_replies.push(reply);
        }
        if self.config.auto_resubscribe {
            let confirmations = self.queue.resubscribe();
            self.internal_confirms.extend(confirmations);
        }

        while let Some(held) = self.offline.pop_front() {
            if held
                .options
                .cancel
                .as_ref()
                .is_some_and(CancelToken::is_cancelled)
            {
                let _ = held.tx.send(Err(EngineError::Aborted));
                continue;
            }
            self.queue.enqueue_prepared(held.encoded, held.options, held.tx);
        }

        self.flush_pipeline();
        debug!("connection ready");
        self.events.push_back(Event::Ready);
    }

    fn track_session(&mut self, kind: SessionKind, reply: Reply) -> Reply {
        let (tx, rx) = oneshot::channel();
        self.session_updates.push(SessionUpdate { kind, reply, tx });
        Completion::new(rx)
    }

    /// Observes settled SELECT/MONITOR replies, committing the session
    /// state on success and forwarding the result to the caller's future.
    fn drain_session_updates(&mut self) {
        let updates = std::mem::take(&mut self.session_updates);
        for mut update in updates {
            match update.reply.try_result() {
                None => self.session_updates.push(update),
                Some(result) => {
                    if result.is_ok() {
                        match update.kind {
                            SessionKind::Select(index) => self.selected_db = Some(index),
                            SessionKind::Monitor => self.monitoring = true,
                        }
                    }
                    let _ = update.tx.send(result);
                }
            }
        }
    }

    /// Internal commands settle inside `feed`; failures are reported as
    /// events rather than failing the ready transition.
    fn drain_internal(&mut self) {
        self.drain_session_updates();
        let mut failed = Vec::new();
        self.internal_replies.retain_mut(|reply| match reply.try_result() {
            None => true,
            Some(Ok(_)) => false,
            Some(Err(err)) => {
                failed.push(err);
                false
            }
        });
        self.internal_confirms
            .retain_mut(|confirm| match confirm.try_result() {
                None => true,
                Some(Ok(())) => false,
                Some(Err(err)) => {
                    failed.push(err);
                    false
                }
            });
        for err in failed {
            warn!(%err, "session restore command failed");
            self.events.push_back(Event::Error(err));
        }
    }

    fn flush_pipeline(&mut self) {
        // User traffic waits for the handshake: before the ready transition
        // only the probe may be written, and that goes through `issue_probe`.
        if self.state != ReadyState::Ready {
            return;
        }
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if !self.writable {
            return;
        }
        while let Some(chunk) = self.queue.flush_chunk(self.config.write_chunk_bytes) {
            if !transport.write(&chunk) {
                self.writable = false;
                break;
            }
        }
    }
}
