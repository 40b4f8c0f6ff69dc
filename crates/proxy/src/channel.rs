//! Transport abstraction.
//!
//! A [`Channel`] moves [`Frame`]s from the host to exactly one renderer. The
//! proxy relies on one property of it: frames are delivered in the order
//! `send` was called, and `send` returning means the frame has been handed to
//! the transport. Inbound frames arrive on an unbounded mpsc receiver that is
//! handed to the proxy alongside the channel.
//!
//! [`memory_channel`] builds an in-process pair for tests and the loopback
//! renderer.

use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use wire::Frame;

/// Errors raised by a [`Channel`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel was closed locally or the peer went away.
    #[error("Channel closed")]
    Closed,

    /// The transport failed to accept the frame.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Host side of a bidirectional, message-oriented transport.
///
/// Only the send chain calls [`Channel::send`]; it never has more than one
/// call in flight per proxy lineage.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Hands one frame to the transport.
    async fn send(&self, frame: Frame) -> Result<(), ChannelError>;

    /// Closes the transport. Idempotent.
    async fn close(&self);
}

/// Receiving half the proxy reads inbound frames from.
pub type Inbound = mpsc::UnboundedReceiver<Frame>;

// ---------------------------------------------------------------------------
// In-memory transport
// ---------------------------------------------------------------------------

/// In-process [`Channel`] backed by a tokio mpsc queue.
#[derive(Debug)]
pub struct MemoryChannel {
    tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        let tx = self
            .tx
            .lock()
            .map_err(|_| ChannelError::Transport("sender lock poisoned".into()))?
            .clone()
            .ok_or(ChannelError::Closed)?;
        tx.send(frame).map_err(|_| ChannelError::Closed)
    }

    async fn close(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
    }
}

/// Renderer side of a [`memory_channel`].
#[derive(Debug)]
pub struct PeerEndpoint {
    /// Frames sent by the host, in send order.
    pub from_host: mpsc::UnboundedReceiver<Frame>,
    /// Frames delivered to the host's inbound receiver.
    pub to_host: mpsc::UnboundedSender<Frame>,
}

impl PeerEndpoint {
    /// Next frame from the host; `None` once the host closed the channel.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_host.recv().await
    }

    /// Delivers a frame to the host.
    pub fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        self.to_host.send(frame).map_err(|_| ChannelError::Closed)
    }
}

/// Creates a connected in-memory transport.
///
/// Returns the host channel, the host's inbound receiver and the renderer end.
pub fn memory_channel() -> (MemoryChannel, Inbound, PeerEndpoint) {
    let (host_tx, peer_rx) = mpsc::unbounded_channel();
    let (peer_tx, host_rx) = mpsc::unbounded_channel();
    let channel = MemoryChannel {
        tx: Mutex::new(Some(host_tx)),
    };
    let peer = PeerEndpoint {
        from_host: peer_rx,
        to_host: peer_tx,
    };
    (channel, host_rx, peer)
}
