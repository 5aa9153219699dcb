//! # Dual-Queue Pipeline Manager
//!
//! Purpose: Guarantee strict FIFO alignment between arbitrarily interleaved
//! submissions and the single ordered reply stream, while supporting
//! cancellation of unsent work, chunked flushing with chain-aware error
//! recovery, and pub/sub traffic multiplexed into the same stream.
//!
//! ## Design Principles
//! 1. **Single Owner**: All queue and registry state lives in one value;
//!    every mutation goes through `&mut self`, so the admission check and
//!    the enqueue are one indivisible step.
//! 2. **Cancellable Only While Unsent**: The cancellation registration is
//!    torn down when a command moves from pending to in-flight.
//! 3. **Replies Never Skip**: The n-th reply settles the n-th in-flight
//!    entry; a reply with no matching entry is a fatal desync, never
//!    silently absorbed.
//! 4. **Push Traffic Is Out-of-Band**: Pub/sub messages are routed to
//!    listeners without consuming an in-flight slot.

use bytes::{Bytes, BytesMut};
use pkv_wire::{encode_command, Push, RespValue};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::command::{CancelToken, ChainId, CommandOptions, Completion, Confirmation, Reply};
use crate::error::{EngineError, EngineResult};
use crate::list::SlotList;
use crate::pubsub::{PubSubKind, PubSubListener, PubSubRegistry, SettleDir};

/// Command sitting in the pending queue: encoded, not yet written.
struct Pending {
    encoded: Vec<u8>,
    chain: Option<ChainId>,
    cancel: Option<CancelToken>,
    settle: Settle,
}

impl Pending {
    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }
}

/// Continuation carried by an in-flight command.
enum Settle {
    /// Ordinary request/reply command.
    Command(oneshot::Sender<EngineResult<RespValue>>),
    /// Batched (un)subscribe: settles once `remaining` acks have arrived.
    PubSub {
        dir: SettleDir,
        count: usize,
        remaining: usize,
        tx: oneshot::Sender<EngineResult<()>>,
    },
}

/// The pipelining engine for one logical connection.
pub struct CommandQueue {
    max_depth: Option<usize>,
    pending: SlotList<Pending>,
    in_flight: SlotList<Settle>,
    pubsub: PubSubRegistry,
    // Chain id of the last command included in the most recent chunk; the
    // recovery boundary for draining an interrupted chain. None means no
    // atomicity boundary.
    chain_boundary: Option<ChainId>,
}

impl CommandQueue {
    /// Creates a queue with an optional maximum combined depth
    /// (pending + in-flight) enforced at admission time.
    pub fn new(max_depth: Option<usize>) -> Self {
        CommandQueue {
            max_depth,
            pending: SlotList::new(),
            in_flight: SlotList::new(),
            pubsub: PubSubRegistry::new(),
            chain_boundary: None,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// True while any subscription is active or settling.
    pub fn is_pubsub_active(&self) -> bool {
        self.pubsub.is_active()
    }

    /// Admission decision for `extra` commands held outside the queue.
    /// Rejection has no side effects.
    pub fn admit(&self, extra: usize) -> EngineResult<()> {
        if self.pubsub.is_active() {
            return Err(EngineError::PubSubMode);
        }
        match self.max_depth {
            Some(max) if self.pending.len() + self.in_flight.len() + extra >= max => {
                Err(EngineError::QueueFull)
            }
            _ => Ok(()),
        }
    }

    /// Encodes and enqueues a command with default options.
    pub fn enqueue(&mut self, args: &[&[u8]]) -> EngineResult<Reply> {
        self.enqueue_with(args, CommandOptions::default())
    }

    /// Encodes and enqueues a command.
    pub fn enqueue_with(&mut self, args: &[&[u8]], options: CommandOptions) -> EngineResult<Reply> {
        let mut encoded = Vec::new();
        encode_command(args, &mut encoded);
        self.enqueue_encoded(encoded, options)
    }

    /// Enqueues an already-encoded command.
    ///
    /// Fails up front with `PubSubMode`/`QueueFull` at admission, or with
    /// `Aborted` when the supplied token has already fired; in every
    /// rejection case nothing enters the queue.
    pub fn enqueue_encoded(
        &mut self,
        encoded: Vec<u8>,
        options: CommandOptions,
    ) -> EngineResult<Reply> {
        self.admit(0)?;
        if options.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(EngineError::Aborted);
        }
        Ok(self.push(encoded, options))
    }

    /// Internal control commands (readiness probe, session restore) bypass
    /// admission: they must be accepted even in pub/sub mode.
    pub(crate) fn enqueue_internal(&mut self, args: &[&[u8]], asap: bool) -> Reply {
        let mut encoded = Vec::new();
        encode_command(args, &mut encoded);
        self.push(
            encoded,
            CommandOptions {
                asap,
                ..CommandOptions::default()
            },
        )
    }

    fn push(&mut self, encoded: Vec<u8>, options: CommandOptions) -> Reply {
        let (tx, rx) = oneshot::channel();
        self.enqueue_prepared(encoded, options, tx);
        Completion::new(rx)
    }

    /// Enqueues a command whose continuation already exists, used when the
    /// connection drains its offline holding area into the queue.
    pub(crate) fn enqueue_prepared(
        &mut self,
        encoded: Vec<u8>,
        options: CommandOptions,
        tx: oneshot::Sender<EngineResult<RespValue>>,
    ) {
        let node = Pending {
            encoded,
            chain: options.chain,
            cancel: options.cancel.clone(),
            settle: Settle::Command(tx),
        };
        let id = if options.asap {
            self.pending.push_front(node)
        } else {
            self.pending.push_back(node)
        };
        if let Some(token) = &options.cancel {
            token.register(id);
        }
    }

    /// Fires `token` and, if its command is still pending, removes it in
    /// O(1) and rejects its future with `Aborted`. Returns whether a
    /// command was actually removed; anything already in flight settles
    /// from its reply as usual.
    pub fn cancel(&mut self, token: &CancelToken) -> bool {
        token.cancel();
        let Some(id) = token.take_registration() else {
            return false;
        };
        let Some(node) = self.pending.remove(id) else {
            return false;
        };
        self.settle(node.settle, Err(EngineError::Aborted));
        true
    }

    /// Drains pending commands from the head into one wire chunk.
    ///
    /// Walks pending in order, accumulating encoded bytes until the size
    /// budget is strictly exceeded (the command crossing the budget is
    /// still included) or the queue is exhausted. Cancelled commands
    /// encountered on the walk are rejected and never included. Included
    /// commands move to the in-flight tail with their cancellation
    /// registrations torn down, and the chain id of the last included
    /// command is recorded as the error-recovery boundary.
    ///
    /// Returns the concatenated bytes for a single transport write, or
    /// `None` when nothing was flushed.
    pub fn flush_chunk(&mut self, budget: usize) -> Option<Bytes> {
        let mut chunk = BytesMut::new();
        let mut included = 0usize;
        let mut last_chain = None;

        let mut cursor = self.pending.head_id();
        while let Some(id) = cursor {
            cursor = self.pending.next_id(id);

            if self.pending.get(id).is_some_and(Pending::is_cancelled) {
                if let Some(node) = self.pending.remove(id) {
                    if let Some(token) = &node.cancel {
                        token.deregister();
                    }
                    self.settle(node.settle, Err(EngineError::Aborted));
                }
                continue;
            }

            let Some(node) = self.pending.get(id) else {
                break;
            };
            chunk.extend_from_slice(&node.encoded);
            last_chain = node.chain;
            included += 1;
            if chunk.len() > budget {
                break;
            }
        }

        if included == 0 {
            return None;
        }

        for _ in 0..included {
            let Some(node) = self.pending.pop_front() else {
                break;
            };
            if let Some(token) = &node.cancel {
                token.deregister();
            }
            self.in_flight.push_back(node.settle);
        }

        self.chain_boundary = last_chain;
        trace!(bytes = chunk.len(), commands = included, "flushed chunk");
        Some(chunk.freeze())
    }

    /// Routes one decoded reply: pub/sub push traffic goes out-of-band,
    /// everything else settles the oldest in-flight command.
    pub fn on_reply(&mut self, reply: RespValue) -> EngineResult<()> {
        if self.pubsub.is_active() {
            if let Some(push) = reply.as_push() {
                match push {
                    Push::Message { channel, payload } => {
                        let listeners = self.pubsub.channel_listeners(channel);
                        Self::deliver(&listeners, payload, channel);
                        return Ok(());
                    }
                    Push::PatternMessage {
                        pattern,
                        channel,
                        payload,
                    } => {
                        let listeners = self.pubsub.pattern_listeners(pattern);
                        Self::deliver(&listeners, payload, channel);
                        return Ok(());
                    }
                    Push::SubscribeAck { .. } | Push::UnsubscribeAck { .. } => {
                        return self.on_ack();
                    }
                }
            }
        }

        let result = match reply {
            RespValue::Error(message) => Err(EngineError::Server(
                String::from_utf8_lossy(&message).into_owned(),
            )),
            other => Ok(other),
        };
        self.settle_front(result)
    }

    /// Registers `listener` for each name and queues one batched subscribe
    /// covering the names no listener wanted before. The confirmation
    /// resolves once every name in the batch is acknowledged.
    pub fn subscribe(
        &mut self,
        kind: PubSubKind,
        names: &[&[u8]],
        listener: &PubSubListener,
    ) -> Confirmation {
        let fresh = self.pubsub.plan_subscribe(kind, names, listener);
        self.push_pubsub(kind.subscribe_verb(), SettleDir::Subscribe, fresh)
    }

    /// Removes `listener` (or, with `None`, all listeners) from each name
    /// and queues one batched unsubscribe for the names left with no
    /// interest.
    pub fn unsubscribe(
        &mut self,
        kind: PubSubKind,
        names: &[&[u8]],
        listener: Option<&PubSubListener>,
    ) -> Confirmation {
        let stale = self.pubsub.plan_unsubscribe(kind, names, listener);
        self.push_pubsub(kind.unsubscribe_verb(), SettleDir::Unsubscribe, stale)
    }

    /// Rebuilds server-side subscription state after a reconnect: one
    /// channel batch and one pattern batch, issued concurrently. Listener
    /// sets are untouched. No-op when nothing was subscribed or settling
    /// upward.
    pub fn resubscribe(&mut self) -> Vec<Confirmation> {
        if !self.pubsub.has_interest() {
            return Vec::new();
        }
        let (channels, patterns) = self.pubsub.reset_for_resubscribe();
        debug!(
            channels = channels.len(),
            patterns = patterns.len(),
            "resubscribing after reconnect"
        );

        let mut confirmations = Vec::new();
        if !channels.is_empty() {
            confirmations.push(self.push_pubsub(
                PubSubKind::Channel.subscribe_verb(),
                SettleDir::Subscribe,
                channels,
            ));
        }
        if !patterns.is_empty() {
            confirmations.push(self.push_pubsub(
                PubSubKind::Pattern.subscribe_verb(),
                SettleDir::Subscribe,
                patterns,
            ));
        }
        confirmations
    }

    /// Rejects everything currently in flight with `err`, then drains from
    /// the pending head the unsent remainder of the interrupted chain, if
    /// one was recorded: a transaction whose earlier part already failed
    /// must never be sent standalone.
    pub fn fail_in_flight(&mut self, err: &EngineError) {
        let dropped = self.in_flight.len();
        while let Some(settle) = self.in_flight.pop_front() {
            self.settle(settle, Err(err.clone()));
        }
        if dropped > 0 {
            debug!(dropped, %err, "failed in-flight commands");
        }

        let Some(boundary) = self.chain_boundary.take() else {
            return;
        };
        while let Some(id) = self.pending.head_id() {
            let in_chain = self
                .pending
                .get(id)
                .is_some_and(|node| node.chain == Some(boundary));
            if !in_chain {
                break;
            }
            if let Some(node) = self.pending.remove(id) {
                if let Some(token) = &node.cancel {
                    token.deregister();
                }
                self.settle(node.settle, Err(err.clone()));
            }
        }
    }

    /// Hard reset: rejects and drains both queues unconditionally.
    pub fn fail_all(&mut self, err: &EngineError) {
        self.fail_in_flight(err);
        while let Some(node) = self.pending.pop_front() {
            if let Some(token) = &node.cancel {
                token.deregister();
            }
            self.settle(node.settle, Err(err.clone()));
        }
        self.chain_boundary = None;
    }

    fn on_ack(&mut self) -> EngineResult<()> {
        let batch_done = match self.in_flight.front_mut() {
            Some(Settle::PubSub { remaining, .. }) => {
                *remaining -= 1;
                *remaining == 0
            }
            // An ack with no settling batch at the head means the streams
            // are no longer aligned.
            _ => return Err(EngineError::Desync),
        };
        if batch_done {
            let settle = self.in_flight.pop_front().ok_or(EngineError::Desync)?;
            self.settle(settle, Ok(RespValue::Bulk(None)));
        }
        Ok(())
    }

    fn settle_front(&mut self, result: EngineResult<RespValue>) -> EngineResult<()> {
        let settle = self.in_flight.pop_front().ok_or(EngineError::Desync)?;
        self.settle(settle, result);
        Ok(())
    }

    fn settle(&mut self, settle: Settle, result: EngineResult<RespValue>) {
        match settle {
            Settle::Command(tx) => {
                let _ = tx.send(result);
            }
            Settle::PubSub {
                dir, count, tx, ..
            } => match result {
                Ok(_) => {
                    self.pubsub.commit(dir, count);
                    let _ = tx.send(Ok(()));
                }
                Err(err) => {
                    self.pubsub.rollback(dir, count);
                    let _ = tx.send(Err(err));
                }
            },
        }
    }

    fn push_pubsub(&mut self, verb: &[u8], dir: SettleDir, names: Vec<Vec<u8>>) -> Confirmation {
        if names.is_empty() {
            return Completion::settled(Ok(()));
        }

        let mut args: Vec<&[u8]> = Vec::with_capacity(names.len() + 1);
        args.push(verb);
        args.extend(names.iter().map(Vec::as_slice));
        let mut encoded = Vec::new();
        encode_command(&args, &mut encoded);

        self.pubsub.begin(dir, names.len());
        let (tx, rx) = oneshot::channel();
        self.pending.push_back(Pending {
            encoded,
            chain: None,
            cancel: None,
            settle: Settle::PubSub {
                dir,
                count: names.len(),
                remaining: names.len(),
                tx,
            },
        });
        Completion::new(rx)
    }

    fn deliver(listeners: &[PubSubListener], payload: &[u8], channel: &[u8]) {
        if listeners.is_empty() {
            debug!(
                channel = %String::from_utf8_lossy(channel),
                "dropping push message with no listeners"
            );
            return;
        }
        for listener in listeners {
            listener(payload, channel);
        }
    }
}
