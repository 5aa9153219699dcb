//! # PipeKV Pipelining Client Engine
//!
//! Purpose: Drive a single strictly-ordered RESP2 connection: pipeline
//! arbitrarily interleaved requests, match every reply back to its request
//! in FIFO order, multiplex pub/sub push traffic out of the same stream,
//! and resume session state deterministically after reconnects.
//!
//! ## Design Principles
//! 1. **Single-Threaded Core**: One owned engine, mutated only through
//!    `&mut self`; futures settle at well-defined points, never from a
//!    parallel worker.
//! 2. **Cancellable While Unsent**: A command can be aborted exactly until
//!    its bytes are handed to the transport, never after.
//! 3. **Admission Over Blocking**: Backpressure rejects at submission time
//!    instead of stalling the caller.
//! 4. **External Transport**: Sockets, reconnect policy and timers belong
//!    to the embedder.

mod command;
mod connection;
mod error;
mod list;
mod pubsub;
mod queue;
mod ready;

pub use command::{CancelToken, ChainId, CommandOptions, Completion, Confirmation, Reply};
pub use connection::{Connection, ConnectionConfig, Event, Transport};
pub use error::{EngineError, EngineResult};
pub use pubsub::{PubSubKind, PubSubListener};
pub use queue::CommandQueue;
pub use ready::ReadyState;
