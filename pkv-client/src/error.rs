//! # Engine Error Taxonomy
//!
//! Purpose: One cloneable error type for every way a queued command can
//! fail, so a single connection-level failure can settle many futures.

use thiserror::Error;

/// Result type for the pipelining engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the pipelining engine.
///
/// `Aborted`, `QueueFull` and `PubSubMode` are recoverable and local to one
/// command. `Server` settles exactly one future and leaves the queues
/// intact. `Desync`, `Protocol` and `ReadyCheck` are fatal to the
/// connection: the transport must be torn down because request/reply
/// alignment (or the connect attempt) can no longer be trusted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Command was cancelled before its bytes were written.
    #[error("command aborted before it was sent")]
    Aborted,
    /// Combined pending + in-flight depth reached the configured maximum.
    #[error("command queue is full")]
    QueueFull,
    /// Only pub/sub commands are accepted while subscriptions are active.
    #[error("cannot send regular commands in pub/sub mode")]
    PubSubMode,
    /// Server replied with a protocol-level error.
    #[error("server error: {0}")]
    Server(String),
    /// A reply arrived with no in-flight command to match it against.
    #[error("protocol desync: unexpected reply with no in-flight command")]
    Desync,
    /// Inbound bytes could not be framed as a reply.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The post-connect readiness probe failed for a real reason.
    #[error("ready check failed: {0}")]
    ReadyCheck(String),
    /// The connection dropped while work was queued or in flight.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}
