//! # PipeKV Wire Protocol
//!
//! Purpose: Encode RESP2 request frames and decode server replies
//! incrementally, keeping allocations under control.
//!
//! ## Design Principles
//! 1. **Binary-Safe**: Bulk strings are raw bytes end to end.
//! 2. **Incremental Decoding**: Partial input is never consumed; a reply is
//!    taken from the buffer only once it is complete.
//! 3. **Explicit Shapes**: Push messages are classified into a tagged enum
//!    before dispatch, never duck-typed element by element.
//! 4. **Fail Fast**: Invalid framing surfaces as a protocol error immediately.

mod codec;
mod value;

pub use codec::{decode, encode_command, WireError};
pub use value::{Push, RespValue};
