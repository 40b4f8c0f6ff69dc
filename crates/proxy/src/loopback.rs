//! In-process stand-in for a renderer.
//!
//! [`StubRenderer`] sits on the [`PeerEndpoint`] of a [`memory_channel`],
//! answers the capability handshake, records every command it receives
//! (decoded back into instructions) and answers queries through a handler.
//! It backs the integration tests and the `glbridge` loopback session.
//!
//! [`memory_channel`]: crate::channel::memory_channel

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use wire::{CommandId, Frame, InboundMessage, OutboundMessage, RemoteFailure, ResolvedInstruction};

use crate::channel::PeerEndpoint;

/// Answers one query instruction: `Ok` becomes `queryReply`, `Err` becomes
/// `queryError`.
pub type QueryHandler = Arc<dyn Fn(&ResolvedInstruction) -> Result<Value, String> + Send + Sync>;

/// Kind of a frame received by the stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivedKind {
    /// Handshake request for constants.
    GetConstants,
    /// Handshake request for methods.
    GetMethods,
    /// Batch of executed instructions.
    Exec,
    /// Single-instruction query.
    Query,
}

/// One frame as seen by the stub, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct Received {
    pub kind: ReceivedKind,
    /// Correlation id from the frame metadata.
    pub cmd_id: Option<CommandId>,
    /// Decoded instructions; empty for handshake requests.
    pub instructions: Vec<ResolvedInstruction>,
}

/// Shared view of everything the stub has received.
#[derive(Debug, Clone, Default)]
pub struct ReceivedLog(Arc<Mutex<Vec<Received>>>);

impl ReceivedLog {
    /// Every frame received so far.
    pub fn snapshot(&self) -> Vec<Received> {
        self.entries().clone()
    }

    /// Received exec and query frames, skipping the handshake.
    pub fn commands(&self) -> Vec<Received> {
        self.entries()
            .iter()
            .filter(|r| matches!(r.kind, ReceivedKind::Exec | ReceivedKind::Query))
            .cloned()
            .collect()
    }

    fn push(&self, received: Received) {
        self.entries().push(received);
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Received>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scripted renderer peer.
pub struct StubRenderer {
    constants: Map<String, Value>,
    methods: Vec<String>,
    handler: QueryHandler,
    log: ReceivedLog,
}

impl std::fmt::Debug for StubRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubRenderer")
            .field("constants", &self.constants.len())
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

impl StubRenderer {
    /// A renderer exposing exactly these capabilities; queries answer `null`.
    pub fn new(constants: Map<String, Value>, methods: Vec<String>) -> Self {
        Self {
            constants,
            methods,
            handler: Arc::new(|_| Ok(Value::Null)),
            log: ReceivedLog::default(),
        }
    }

    /// A small WebGL-shaped context: shader and buffer plumbing, real enum
    /// values, and queries that report success.
    pub fn webgl_subset() -> Self {
        let constants = [
            ("FRAGMENT_SHADER", 35632),
            ("VERTEX_SHADER", 35633),
            ("COMPILE_STATUS", 35713),
            ("LINK_STATUS", 35714),
            ("ARRAY_BUFFER", 34962),
            ("ELEMENT_ARRAY_BUFFER", 34963),
            ("STATIC_DRAW", 35044),
            ("FLOAT", 5126),
            ("TRIANGLES", 4),
            ("COLOR_BUFFER_BIT", 16384),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_owned(), json!(value)))
        .collect();
        let methods = [
            "createShader",
            "shaderSource",
            "compileShader",
            "getShaderParameter",
            "getShaderInfoLog",
            "deleteShader",
            "createProgram",
            "attachShader",
            "linkProgram",
            "getProgramParameter",
            "getProgramInfoLog",
            "deleteProgram",
            "useProgram",
            "createBuffer",
            "bindBuffer",
            "bufferData",
            "getAttribLocation",
            "enableVertexAttribArray",
            "vertexAttribPointer",
            "getUniformLocation",
            "uniformMatrix4fv",
            "clearColor",
            "clear",
            "drawArrays",
        ]
        .into_iter()
        .map(str::to_owned)
        .collect();

        Self::new(constants, methods).with_handler(|instruction| {
            match instruction.op.as_str() {
                "getShaderParameter" | "getProgramParameter" => Ok(json!(true)),
                "getShaderInfoLog" | "getProgramInfoLog" => Ok(json!("")),
                "getAttribLocation" | "getUniformLocation" => Ok(json!(0)),
                _ => Ok(Value::Null),
            }
        })
    }

    /// Replaces the query handler.
    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ResolvedInstruction) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.handler = Arc::new(handler);
        self
    }

    /// Handle onto the frames this stub receives.
    pub fn log(&self) -> ReceivedLog {
        self.log.clone()
    }

    /// Serves `peer` until the host closes the channel.
    pub fn spawn(self, mut peer: PeerEndpoint) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(frame) = peer.recv().await {
                match self.answer(&frame) {
                    Ok(Some(reply)) => {
                        if peer.send(reply).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(message) => warn!(%message, "stub renderer rejected frame"),
                }
            }
            debug!("stub renderer stopped");
        })
    }

    fn answer(&self, frame: &Frame) -> Result<Option<Frame>, String> {
        let message = frame.parse_outbound().map_err(|e| e.to_string())?;
        let cmd_id = frame.cmd_id();
        let (kind, instructions) = match message {
            OutboundMessage::GetConstants { .. } => (ReceivedKind::GetConstants, Vec::new()),
            OutboundMessage::GetMethods { .. } => (ReceivedKind::GetMethods, Vec::new()),
            OutboundMessage::Exec { instructions } => (ReceivedKind::Exec, instructions),
            OutboundMessage::Query { instructions } => (ReceivedKind::Query, instructions),
        };
        let instructions = wire::decode(&instructions, &frame.buffers).map_err(|e| e.to_string())?;
        self.log.push(Received {
            kind,
            cmd_id,
            instructions: instructions.clone(),
        });

        let reply = match kind {
            ReceivedKind::GetConstants => InboundMessage::ConstantsReply {
                data: self.constants.clone(),
            },
            ReceivedKind::GetMethods => InboundMessage::MethodsReply {
                data: self.methods.clone(),
            },
            ReceivedKind::Exec => return Ok(None),
            ReceivedKind::Query => {
                let outcome = instructions
                    .first()
                    .ok_or_else(|| "query without instructions".to_owned())
                    .and_then(|instruction| (self.handler)(instruction));
                match outcome {
                    Ok(data) => InboundMessage::QueryReply { data },
                    Err(message) => InboundMessage::QueryError {
                        data: RemoteFailure { message },
                    },
                }
            }
        };
        Frame::inbound(&reply, cmd_id)
            .map(Some)
            .map_err(|e| e.to_string())
    }
}
