//! Error types for the remote proxy.
//!
//! [`ProxyError`] is what every fallible proxy operation returns. Failures
//! that arrive asynchronously through a pending reply are [`ReplyError`]s:
//! they are `Clone` because one reply may be awaited by several holders.
//!
//! Cancellation (channel gone) has its own variant, separate from
//! [`ReplyError::Timeout`] and [`ReplyError::Remote`].

use std::time::Duration;

use thiserror::Error;
use wire::{CommandId, WireError};

use crate::channel::ChannelError;

// ---------------------------------------------------------------------------
// Reply-borne errors
// ---------------------------------------------------------------------------

/// Why a pending reply did not produce a value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplyError {
    /// No reply arrived within the query's timeout. The ledger entry has been
    /// removed; a late reply is discarded.
    #[error("Query {command} timed out after {after:?}")]
    Timeout { command: CommandId, after: Duration },

    /// The renderer answered with `queryError`.
    #[error("Remote error: {message}")]
    Remote { message: String },

    /// The channel was torn down while the query was outstanding.
    #[error("Query cancelled: channel closed")]
    Cancelled,

    /// The query message never reached the channel.
    #[error("Query was not sent: {reason}")]
    NotSent { reason: String },

    /// No query with this id is outstanding.
    #[error("No outstanding query {command}")]
    Unknown { command: CommandId },
}

// ---------------------------------------------------------------------------
// Proxy errors
// ---------------------------------------------------------------------------

/// Errors surfaced by [`crate::RemoteProxy`] and its collaborators.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The name is neither a known constant nor a known method.
    ///
    /// Only legitimate before the handshake completes or for typos; never retried.
    #[error("Unknown capability: {name}")]
    UnknownCapability { name: String },

    /// An argument has no wire representation.
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// The operation is not allowed in the current state (e.g. a query inside
    /// an active batch of the same handle).
    #[error("Illegal state: {reason}")]
    IllegalState { reason: String },

    /// A batch was flushed while one of its instructions was never invoked.
    #[error("Instruction '{operation}' was never called before its batch was flushed")]
    UnflushedInstruction { operation: String },

    /// An inbound frame did not follow the message schema.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// A query failed, or a pending argument this send depended on failed.
    #[error(transparent)]
    Reply(#[from] ReplyError),

    /// The transport refused the frame.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The capability handshake did not complete in time.
    #[error("Capability handshake did not complete within {after:?}")]
    HandshakeTimeout { after: Duration },

    /// The proxy lineage has been closed.
    #[error("Proxy is closed")]
    Closed,

    /// The task performing a send was aborted before reporting an outcome.
    #[error("Send task aborted before completion")]
    SendAborted,

    /// A shader failed to compile; `log` is the renderer's info log.
    #[error("An error occurred compiling the shader: {log}")]
    ShaderCompile { log: String },

    /// A program failed to link; `log` is the renderer's info log.
    #[error("Unable to initialize the shader program: {log}")]
    ProgramLink { log: String },
}

impl ProxyError {
    pub(crate) fn illegal(reason: impl Into<String>) -> Self {
        Self::IllegalState {
            reason: reason.into(),
        }
    }
}

impl From<WireError> for ProxyError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::InvalidArgument { reason } => Self::InvalidArgument { reason },
            WireError::Protocol { message } => Self::Protocol { message },
        }
    }
}
