//! GlBridge CLI entry point.
//!
//! This binary is the composition root. Responsibilities:
//!
//! 1. **Parse configuration**: load the optional TOML file given by
//!    `--config` and apply command-line overrides on top of it.
//! 2. **Wire observability**: configure `tracing-subscriber` with an
//!    `EnvFilter` and either a human-readable or a JSON formatter. All
//!    `tracing` spans and events emitted by the workspace flow through it.
//! 3. **Run a loopback session**: connect a [`RemoteProxy`] to an in-process
//!    [`StubRenderer`], build a shader program, upload a triangle, draw a
//!    number of frames, and report what the renderer received.
//!
//! ## Configuration file
//!
//! ```toml
//! [proxy]
//! query_timeout_ms = 30000
//! handshake_timeout_ms = 10000
//!
//! [logging]
//! filter = "info,proxy=debug"
//! format = "json"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use proxy::{
    args, make_program, memory_channel, BinaryArray, ProxyConfig, ReceivedKind, RemoteProxy,
    StubRenderer,
};
use serde::Deserialize;
use tracing::{info, info_span, Instrument};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

const VERTEX_SOURCE: &str = "\
attribute vec3 position;
void main() { gl_Position = vec4(position, 1.0); }
";

const FRAGMENT_SOURCE: &str = "\
precision mediump float;
void main() { gl_FragColor = vec4(1.0, 0.5, 0.0, 1.0); }
";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    /// `EnvFilter` directives; `RUST_LOG` is used when absent.
    filter: Option<String>,
    format: LogFormat,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    proxy: ProxyConfig,
    logging: LoggingConfig,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }
}

/// Drives a renderer context over the GlBridge command channel.
#[derive(Debug, Parser)]
#[command(name = "glbridge", version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Log filter directives, e.g. `info,proxy=debug`.
    #[arg(long, value_name = "FILTER")]
    log_filter: Option<String>,

    /// Default bound for query replies, in milliseconds.
    #[arg(long, value_name = "MS")]
    query_timeout_ms: Option<u64>,

    /// Frames to draw in the loopback session.
    #[arg(long, default_value_t = 3)]
    frames: u32,
}

impl Cli {
    fn resolve_config(&self) -> Result<FileConfig> {
        let mut config = match &self.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
        if let Some(filter) = &self.log_filter {
            config.logging.filter = Some(filter.clone());
        }
        if let Some(ms) = self.query_timeout_ms {
            config.proxy.query_timeout_ms = ms;
        }
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Observability
// ---------------------------------------------------------------------------

fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = match &config.filter {
        Some(directives) => EnvFilter::try_new(directives)
            .with_context(|| format!("invalid log filter '{directives}'"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let installed = match config.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("installing tracing subscriber: {e}"))
}

// ---------------------------------------------------------------------------
// Loopback session
// ---------------------------------------------------------------------------

async fn run_loopback(config: ProxyConfig, frames: u32) -> Result<()> {
    let (channel, inbound, peer) = memory_channel();
    let renderer = StubRenderer::webgl_subset();
    let log = renderer.log();
    let server = renderer.spawn(peer);

    let gl = RemoteProxy::connect(Arc::new(channel), inbound, config)
        .await
        .context("connecting to the loopback renderer")?;
    if let Some(capabilities) = gl.capabilities() {
        info!(
            constants = capabilities.constants().len(),
            methods = capabilities.methods().len(),
            "renderer capabilities"
        );
    }

    let program = make_program(&gl, VERTEX_SOURCE, FRAGMENT_SOURCE)
        .await
        .context("program task panicked")?
        .context("building the shader program")?;

    let array_buffer = gl.constant("ARRAY_BUFFER")?;
    let position = gl.query("getAttribLocation", args![program, "position"])?;
    let buffer = gl.chunk(|gl| {
        let buffer = gl.exec_returning("createBuffer", args![])?;
        gl.exec("bindBuffer", args![array_buffer.clone(), buffer])?;
        gl.exec(
            "bufferData",
            args![
                array_buffer.clone(),
                BinaryArray::from_f32s(&[0.0, 0.5, 0.0, -0.5, -0.5, 0.0, 0.5, -0.5, 0.0]),
                gl.constant("STATIC_DRAW")?
            ],
        )?;
        gl.exec("enableVertexAttribArray", args![&position])?;
        gl.exec(
            "vertexAttribPointer",
            args![&position, 3, gl.constant("FLOAT")?, false, 0, 0],
        )?;
        Ok(buffer)
    })?;
    info!(%program, %buffer, "geometry uploaded");

    let color_bit = gl.constant("COLOR_BUFFER_BIT")?;
    let triangles = gl.constant("TRIANGLES")?;
    for frame in 0..frames {
        gl.chunk(|gl| {
            gl.exec("clearColor", args![0.1, 0.1, 0.1, 1.0])?;
            gl.exec("clear", args![color_bit.clone()])?;
            gl.exec("useProgram", args![program])?;
            gl.exec("drawArrays", args![triangles.clone(), 0, 3])?;
            Ok(())
        })
        .with_context(|| format!("drawing frame {frame}"))?;
    }

    gl.flushed().await;
    let cancelled = gl.close().await?;
    server.await.context("loopback renderer task panicked")?;

    let commands = log.commands();
    let execs = commands
        .iter()
        .filter(|r| r.kind == ReceivedKind::Exec)
        .count();
    let instructions: usize = commands.iter().map(|r| r.instructions.len()).sum();
    println!(
        "loopback session: {} exec, {} query, {instructions} instructions, {cancelled} cancelled",
        execs,
        commands.len() - execs,
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.resolve_config()?;
    init_tracing(&config.logging)?;

    run_loopback(config.proxy, cli.frames)
        .instrument(info_span!("loopback", frames = cli.frames))
        .await
}
