//! Wire messages and the frames that carry them.
//!
//! A [`Frame`] is the unit the transport moves: a JSON `data` payload, a JSON
//! `metadata` object and a list of out-of-band binary buffers. The payload is
//! one of the tagged message types below.
//!
//! | Direction | `type` | Payload |
//! |-----------|--------|---------|
//! | host → renderer | `getConstants` / `getMethods` | `target: "context"` |
//! | host → renderer | `exec` / `query` | `instructions: [{op, args, ret?}]` |
//! | renderer → host | `constantsReply` | `data: {name: value}` |
//! | renderer → host | `methodsReply` | `data: [name]` |
//! | renderer → host | `queryReply` | `data: <any>` |
//! | renderer → host | `queryError` | `data: {message}` |
//!
//! Query messages and their replies carry `cmd_id` in the metadata.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{BinaryArray, CommandId, SerializedInstruction, WireError};

/// Object on the renderer a handshake request is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    /// The graphics context itself.
    Context,
}

/// Messages sent by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundMessage {
    /// Handshake: asks for every constant of `target`.
    GetConstants { target: Target },
    /// Handshake: asks for every callable operation of `target`.
    GetMethods { target: Target },
    /// Fire-and-forget batch of instructions.
    Exec { instructions: Vec<SerializedInstruction> },
    /// Single instruction whose result is sent back with the same `cmd_id`.
    Query { instructions: Vec<SerializedInstruction> },
}

impl OutboundMessage {
    /// Message kind as it appears in the `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GetConstants { .. } => "getConstants",
            Self::GetMethods { .. } => "getMethods",
            Self::Exec { .. } => "exec",
            Self::Query { .. } => "query",
        }
    }
}

/// Failure report attached to a `queryError` message.
///
/// Renderers send either `{"message": "..."}` or a bare string; both are
/// accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RemoteFailureRepr")]
pub struct RemoteFailure {
    /// Renderer-supplied description.
    pub message: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RemoteFailureRepr {
    Structured { message: String },
    Text(String),
}

impl From<RemoteFailureRepr> for RemoteFailure {
    fn from(repr: RemoteFailureRepr) -> Self {
        match repr {
            RemoteFailureRepr::Structured { message } | RemoteFailureRepr::Text(message) => {
                Self { message }
            }
        }
    }
}

/// Messages sent by the renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundMessage {
    /// Answer to `getConstants`: constant name to value.
    ConstantsReply { data: Map<String, Value> },
    /// Answer to `getMethods`: callable operation names.
    MethodsReply { data: Vec<String> },
    /// Result of a query.
    QueryReply { data: Value },
    /// The renderer failed to run a query.
    QueryError { data: RemoteFailure },
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Metadata object of a frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMetadata {
    /// Correlation id of a query and its reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd_id: Option<CommandId>,
}

/// One transport-level message.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// The tagged message.
    pub data: Value,
    pub metadata: FrameMetadata,
    /// Out-of-band buffers referenced by `"buffer<N>"` tags in `data`.
    pub buffers: Vec<BinaryArray>,
}

impl Frame {
    /// Builds a host → renderer frame.
    pub fn outbound(
        message: &OutboundMessage,
        cmd_id: Option<CommandId>,
        buffers: Vec<BinaryArray>,
    ) -> Result<Self, WireError> {
        Self::build(message, cmd_id, buffers)
    }

    /// Builds a renderer → host frame.
    pub fn inbound(message: &InboundMessage, cmd_id: Option<CommandId>) -> Result<Self, WireError> {
        Self::build(message, cmd_id, Vec::new())
    }

    /// Parses the payload of a renderer → host frame.
    pub fn parse_inbound(&self) -> Result<InboundMessage, WireError> {
        self.parse()
    }

    /// Parses the payload of a host → renderer frame.
    pub fn parse_outbound(&self) -> Result<OutboundMessage, WireError> {
        self.parse()
    }

    /// Returns the correlation id, if any.
    pub fn cmd_id(&self) -> Option<CommandId> {
        self.metadata.cmd_id
    }

    fn build<M: Serialize>(
        message: &M,
        cmd_id: Option<CommandId>,
        buffers: Vec<BinaryArray>,
    ) -> Result<Self, WireError> {
        let data = serde_json::to_value(message).map_err(|e| WireError::InvalidArgument {
            reason: e.to_string(),
        })?;
        Ok(Self {
            data,
            metadata: FrameMetadata { cmd_id },
            buffers,
        })
    }

    fn parse<M: for<'de> Deserialize<'de>>(&self) -> Result<M, WireError> {
        M::deserialize(&self.data).map_err(|e| WireError::Protocol {
            message: format!("{e} in {}", self.data),
        })
    }
}
