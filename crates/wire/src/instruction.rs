//! Instruction records and the encoder that turns them into wire form.
//!
//! Encoding walks every argument of every instruction in a message:
//!
//! | Argument | Wire form |
//! |----------|-----------|
//! | JSON value | passed through unchanged |
//! | float | JSON number (must be finite) |
//! | binary array | moved to the buffer list, replaced by `"buffer<N>"` |
//! | remote reference | `{"__ref__": id}` |
//!
//! `N` counts buffers across the whole message, so the tags of a batch index
//! one shared out-of-band list.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ArgValue, BinaryArray, RemoteRef, WireError};

const BUFFER_TAG_PREFIX: &str = "buffer";

/// One named remote operation with all arguments available.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedInstruction {
    /// Name of the renderer operation.
    pub op: String,
    /// Arguments in call order.
    pub args: Vec<ArgValue>,
    /// Reference the renderer must store the operation's result under.
    pub ret: Option<RemoteRef>,
}

impl ResolvedInstruction {
    pub fn new(op: impl Into<String>, args: Vec<ArgValue>) -> Self {
        Self {
            op: op.into(),
            args,
            ret: None,
        }
    }

    /// Sets the reference the result is stored under.
    pub fn returning(mut self, ret: RemoteRef) -> Self {
        self.ret = Some(ret);
        self
    }
}

/// JSON-safe form of an instruction as it appears inside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedInstruction {
    /// Name of the renderer operation.
    pub op: String,
    /// JSON arguments; buffers appear as tags, references as `{"__ref__": id}`.
    pub args: Vec<Value>,
    /// Reference the renderer stores the result under, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ret: Option<RemoteRef>,
}

/// Returns the tag that stands in for buffer `index`.
pub fn buffer_tag(index: usize) -> String {
    format!("{BUFFER_TAG_PREFIX}{index}")
}

/// Parses a tag produced by [`buffer_tag`].
pub fn parse_buffer_tag(tag: &str) -> Option<usize> {
    let digits = tag.strip_prefix(BUFFER_TAG_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Serialises instructions and extracts their binary arguments.
///
/// Fails with [`WireError::InvalidArgument`] if any argument has no wire
/// representation; nothing is produced for a partially valid batch.
pub fn encode(
    instructions: Vec<ResolvedInstruction>,
) -> Result<(Vec<SerializedInstruction>, Vec<BinaryArray>), WireError> {
    let mut buffers = Vec::new();
    let mut serialized = Vec::with_capacity(instructions.len());

    for instruction in instructions {
        let mut args = Vec::with_capacity(instruction.args.len());
        for arg in instruction.args {
            let encoded = match arg {
                ArgValue::Json(value) => value,
                ArgValue::Float(v) => serde_json::Number::from_f64(v)
                    .map(Value::Number)
                    .ok_or_else(|| {
                        WireError::invalid(format!(
                            "argument {v} to {} is not a finite float",
                            instruction.op
                        ))
                    })?,
                ArgValue::Buffer(array) => {
                    let tag = buffer_tag(buffers.len());
                    buffers.push(array);
                    Value::String(tag)
                }
                ArgValue::Ref(r) => r.to_json(),
            };
            args.push(encoded);
        }
        serialized.push(SerializedInstruction {
            op: instruction.op,
            args,
            ret: instruction.ret,
        });
    }

    Ok((serialized, buffers))
}

/// Inverse of [`encode`], used by renderer-side stubs.
///
/// Numbers come back as [`ArgValue::Json`]; the float/JSON distinction only
/// matters on the way out.
pub fn decode(
    instructions: &[SerializedInstruction],
    buffers: &[BinaryArray],
) -> Result<Vec<ResolvedInstruction>, WireError> {
    instructions
        .iter()
        .map(|instruction| {
            let args = instruction
                .args
                .iter()
                .map(|arg| decode_arg(arg, buffers))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ResolvedInstruction {
                op: instruction.op.clone(),
                args,
                ret: instruction.ret,
            })
        })
        .collect()
}

fn decode_arg(arg: &Value, buffers: &[BinaryArray]) -> Result<ArgValue, WireError> {
    if let Some(index) = arg.as_str().and_then(parse_buffer_tag) {
        return buffers
            .get(index)
            .cloned()
            .map(ArgValue::Buffer)
            .ok_or_else(|| {
                WireError::protocol(format!(
                    "buffer tag {index} out of range ({} buffers)",
                    buffers.len()
                ))
            });
    }
    if let Some(r) = RemoteRef::from_json(arg) {
        return Ok(ArgValue::Ref(r));
    }
    Ok(ArgValue::Json(arg.clone()))
}
