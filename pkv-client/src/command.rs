//! # Command-Side Types
//!
//! Purpose: The handles a caller holds onto after submitting work: the
//! settlement future, the chain token that groups atomic units, and the
//! cancellation token that is only honored while a command is unsent.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use pkv_wire::RespValue;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::error::{EngineError, EngineResult};
use crate::list::NodeId;

/// Opaque token grouping commands that must be sent and settled as one
/// atomic unit, e.g. a MULTI/EXEC transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainId(u64);

impl ChainId {
    /// Allocates a fresh, process-unique chain token.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        ChainId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

const NO_SLOT: u64 = u64::MAX;

struct CancelShared {
    fired: AtomicBool,
    // Packed NodeId of the pending command this token is registered
    // against, NO_SLOT once it has left the pending queue.
    slot: AtomicU64,
}

/// Cancellation token for a queued command.
///
/// Firing the token is honored only while the command still sits in the
/// pending queue; the registration is torn down the moment the command is
/// flushed, so a late fire is a guaranteed no-op. `CommandQueue::cancel`
/// removes the command eagerly; a token fired directly is swept at the next
/// flush, before its command could enter any chunk.
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<CancelShared>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            shared: Arc::new(CancelShared {
                fired: AtomicBool::new(false),
                slot: AtomicU64::new(NO_SLOT),
            }),
        }
    }

    /// Marks the token as fired. The command is rejected with
    /// [`EngineError::Aborted`] if it has not been flushed yet.
    pub fn cancel(&self) {
        self.shared.fired.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.fired.load(Ordering::Relaxed)
    }

    pub(crate) fn register(&self, id: NodeId) {
        self.shared.slot.store(id.pack(), Ordering::Relaxed);
    }

    pub(crate) fn deregister(&self) {
        self.shared.slot.store(NO_SLOT, Ordering::Relaxed);
    }

    pub(crate) fn take_registration(&self) -> Option<NodeId> {
        NodeId::unpack(self.shared.slot.swap(NO_SLOT, Ordering::Relaxed))
    }

    pub(crate) fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::new()
    }
}

/// Per-command submission options.
#[derive(Clone, Default)]
pub struct CommandOptions {
    /// Jump the line: enqueue at the head of the pending queue. Used for
    /// internal control commands that must go out before user work.
    pub asap: bool,
    /// Atomic-unit membership; see [`ChainId`].
    pub chain: Option<ChainId>,
    /// Cancellation registration; see [`CancelToken`].
    pub cancel: Option<CancelToken>,
}

/// Future that settles when the engine resolves or rejects a submission.
pub struct Completion<T> {
    rx: oneshot::Receiver<EngineResult<T>>,
}

/// Settlement of one request/reply command.
pub type Reply = Completion<RespValue>;

/// Settlement of one (un)subscribe batch: resolves after every name in the
/// batch has been acknowledged.
pub type Confirmation = Completion<()>;

impl<T> Completion<T> {
    pub(crate) fn new(rx: oneshot::Receiver<EngineResult<T>>) -> Self {
        Completion { rx }
    }

    /// An already-settled completion, for batches with nothing to send.
    pub(crate) fn settled(result: EngineResult<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Completion { rx }
    }

    /// Non-blocking probe: `Some` once the engine has settled this
    /// submission. Used internally to observe commands that settled during
    /// the current feed pass.
    pub fn try_result(&mut self) -> Option<EngineResult<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(EngineError::ConnectionLost(
                "settlement channel dropped".into(),
            ))),
        }
    }
}

impl<T> Future for Completion<T> {
    type Output = EngineResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|settled| match settled {
            Ok(result) => result,
            Err(_) => Err(EngineError::ConnectionLost("settlement channel dropped".into())),
        })
    }
}
