//! Codec-level error type.
//!
//! [`WireError`] covers the two failure classes that can be detected without
//! any I/O: arguments the encoder cannot represent, and inbound payloads that
//! do not follow the message schema. Transport, timeout and correlation
//! failures belong to the `proxy` crate.

use thiserror::Error;

/// Errors raised while encoding outbound instructions or parsing frames.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WireError {
    /// An argument value has no wire representation.
    ///
    /// Produced by: non-finite floats, binary arrays whose byte length does
    /// not match their shape and element type.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of the offending value.
        reason: String,
    },

    /// A frame does not follow the message schema.
    ///
    /// Produced by: unknown `type` tags, missing fields, buffer tags that
    /// point past the out-of-band buffer list.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the malformed content.
        message: String,
    },
}

impl WireError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}
