//! Command-channel domain for GlBridge.
//!
//! This crate contains every value that crosses the host/renderer boundary:
//! identifiers, argument values, serialized instructions, wire messages, and
//! the encoder that turns in-memory instructions into a JSON payload plus an
//! out-of-band buffer list.
//!
//! ## Architectural Layer
//!
//! **Domain.** This crate has no I/O dependencies. It defines *what* goes on
//! the wire; the `proxy` crate decides *when* and in which order.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | `CommandId`, `RemoteRef`, `LineageId` |
//! | [`types`] | `ElementType`, `BinaryArray`, `ArgValue` |
//! | [`instruction`] | Instruction records, `encode` / `decode` |
//! | [`message`] | Tagged wire messages and `Frame` |
//! | [`errors`] | `WireError` |

pub mod errors;
pub mod identifiers;
pub mod instruction;
pub mod message;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use errors::WireError;
pub use identifiers::{CommandId, LineageId, RemoteRef, REF_KEY};
pub use instruction::{
    buffer_tag, decode, encode, parse_buffer_tag, ResolvedInstruction, SerializedInstruction,
};
pub use message::{
    Frame, FrameMetadata, InboundMessage, OutboundMessage, RemoteFailure, Target,
};
pub use types::{ArgValue, BinaryArray, ElementType};
