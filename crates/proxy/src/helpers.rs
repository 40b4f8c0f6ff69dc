//! Shader and program setup built on the proxy primitives.
//!
//! Each helper issues its executes through a chunk and waits on a status
//! query afterwards, so a compile or link costs one round trip. The
//! `make_*` variants run the same work on a fresh branch in a spawned task,
//! letting several shaders compile concurrently without disturbing the
//! caller's batching context.

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use wire::RemoteRef;

use crate::args;
use crate::errors::ProxyError;
use crate::proxy::RemoteProxy;

/// Shader stage, named by the renderer constant that selects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderKind {
    Vertex,
    Fragment,
}

impl ShaderKind {
    pub fn constant_name(self) -> &'static str {
        match self {
            Self::Vertex => "VERTEX_SHADER",
            Self::Fragment => "FRAGMENT_SHADER",
        }
    }
}

impl std::fmt::Display for ShaderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vertex => write!(f, "vertex"),
            Self::Fragment => write!(f, "fragment"),
        }
    }
}

/// Creates and compiles a shader.
///
/// On a failed compile the shader is deleted and the renderer's info log is
/// returned in [`ProxyError::ShaderCompile`].
pub async fn ensure_shader(
    gl: &RemoteProxy,
    source: &str,
    kind: ShaderKind,
) -> Result<RemoteRef, ProxyError> {
    let stage = gl.constant(kind.constant_name())?;
    let compile_status = gl.constant("COMPILE_STATUS")?;

    let shader = gl.exec_returning("createShader", args![stage])?;
    gl.chunk(|gl| {
        gl.exec("shaderSource", args![shader, source])?;
        gl.exec("compileShader", args![shader])?;
        Ok(())
    })?;

    let status = gl
        .query("getShaderParameter", args![shader, compile_status])?
        .await?;
    if truthy(&status) {
        debug!(%kind, shader = %shader, "shader compiled");
        return Ok(shader);
    }

    let log = gl.query("getShaderInfoLog", args![shader])?.await?;
    gl.exec("deleteShader", args![shader])?;
    let log = log_text(log);
    warn!(%kind, %log, "shader compile failed");
    Err(ProxyError::ShaderCompile { log })
}

/// Creates a program from two shader sources and links it.
///
/// Both shaders compile concurrently on their own branches. On a failed link
/// the program is deleted and the info log is returned in
/// [`ProxyError::ProgramLink`].
pub async fn ensure_program(
    gl: &RemoteProxy,
    vertex_source: &str,
    fragment_source: &str,
) -> Result<RemoteRef, ProxyError> {
    let link_status = gl.constant("LINK_STATUS")?;
    let program = gl.exec_returning("createProgram", args![])?;

    let (vertex_gl, fragment_gl) = (gl.branch(), gl.branch());
    let (vertex, fragment) = tokio::try_join!(
        ensure_shader(&vertex_gl, vertex_source, ShaderKind::Vertex),
        ensure_shader(&fragment_gl, fragment_source, ShaderKind::Fragment),
    )?;

    gl.chunk(|gl| {
        gl.exec("attachShader", args![program, vertex])?;
        gl.exec("attachShader", args![program, fragment])?;
        gl.exec("linkProgram", args![program])?;
        Ok(())
    })?;

    let status = gl
        .query("getProgramParameter", args![program, link_status])?
        .await?;
    if truthy(&status) {
        debug!(program = %program, "program linked");
        return Ok(program);
    }

    let log = gl.query("getProgramInfoLog", args![program])?.await?;
    gl.exec("deleteProgram", args![program])?;
    let log = log_text(log);
    warn!(%log, "program link failed");
    Err(ProxyError::ProgramLink { log })
}

/// [`ensure_shader`] on a new branch, in a spawned task.
pub fn make_shader(
    gl: &RemoteProxy,
    source: impl Into<String>,
    kind: ShaderKind,
) -> JoinHandle<Result<RemoteRef, ProxyError>> {
    let branch = gl.branch();
    let source = source.into();
    tokio::spawn(async move { ensure_shader(&branch, &source, kind).await })
}

/// [`ensure_program`] on a new branch, in a spawned task.
pub fn make_program(
    gl: &RemoteProxy,
    vertex_source: impl Into<String>,
    fragment_source: impl Into<String>,
) -> JoinHandle<Result<RemoteRef, ProxyError>> {
    let branch = gl.branch();
    let vertex_source = vertex_source.into();
    let fragment_source = fragment_source.into();
    tokio::spawn(async move { ensure_program(&branch, &vertex_source, &fragment_source).await })
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn log_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
