//! Send ordering.
//!
//! Frames reach the channel in the order their sends were *initiated*, even
//! though preparing a frame may suspend for an arbitrary time (a pending
//! argument waits for an earlier query's reply).
//!
//! The chain keeps one tail signal per lineage. Initiating a send is a
//! synchronous [`SendChain::reserve`]: it swaps a fresh signal into the tail
//! and keeps the previous one. The spawned send task then
//!
//! 1. resolves its payload,
//! 2. waits for the previous signal,
//! 3. calls [`Channel::send`],
//! 4. fires its own signal.
//!
//! Step 4 runs whatever happened in steps 1 and 3, so a failed payload or a
//! refused frame never stalls or reorders the sends queued behind it. A
//! reservation dropped without being submitted forwards its predecessor's
//! signal in the same way.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, debug_span, warn, Instrument};
use wire::{Frame, LineageId};

use crate::channel::Channel;
use crate::errors::ProxyError;

#[derive(Debug, Default)]
struct ChainState {
    tail: Option<oneshot::Receiver<()>>,
    next_sequence: u64,
}

/// Orders the physical sends of one proxy lineage.
pub struct SendChain {
    channel: Arc<dyn Channel>,
    lineage: LineageId,
    state: Mutex<ChainState>,
}

impl std::fmt::Debug for SendChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendChain")
            .field("lineage", &self.lineage)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl SendChain {
    pub fn new(channel: Arc<dyn Channel>, lineage: LineageId) -> Self {
        Self {
            channel,
            lineage,
            state: Mutex::new(ChainState::default()),
        }
    }

    /// Takes the next slot in send order.
    pub fn reserve(&self) -> Reservation {
        let (done, tail) = oneshot::channel();
        let mut state = self.state();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let prior = state.tail.replace(tail);
        Reservation {
            sequence,
            prior,
            done: Some(done),
            channel: Arc::clone(&self.channel),
            lineage: self.lineage,
        }
    }

    /// Reserves a slot and submits `payload` into it.
    pub fn enqueue<F>(&self, payload: F) -> SendTicket
    where
        F: Future<Output = Result<Frame, ProxyError>> + Send + 'static,
    {
        self.reserve().submit(payload)
    }

    /// Completes once every send reserved before this call has finished.
    pub async fn barrier(&self) {
        let mut reservation = self.reserve();
        reservation.wait_prior().await;
    }

    /// Sequence number the next reservation will receive.
    pub fn next_sequence(&self) -> u64 {
        self.state().next_sequence
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------

/// A slot in send order, taken at initiation time.
#[must_use = "a reservation holds up every later send until it is submitted or dropped"]
pub struct Reservation {
    sequence: u64,
    prior: Option<oneshot::Receiver<()>>,
    done: Option<oneshot::Sender<()>>,
    channel: Arc<dyn Channel>,
    lineage: LineageId,
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("sequence", &self.sequence)
            .field("lineage", &self.lineage)
            .finish_non_exhaustive()
    }
}

impl Reservation {
    /// Position of this slot within the lineage.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Spawns the task that prepares and transmits the frame for this slot.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<F>(mut self, payload: F) -> SendTicket
    where
        F: Future<Output = Result<Frame, ProxyError>> + Send + 'static,
    {
        let prior = self.prior.take();
        let done = self.done.take();
        let channel = Arc::clone(&self.channel);
        let sequence = self.sequence;
        let span = debug_span!("send", lineage = %self.lineage, sequence);

        let handle = tokio::spawn(
            async move {
                let frame = payload.await;
                if let Some(prior) = prior {
                    // A dropped predecessor counts as finished.
                    let _ = prior.await;
                }
                let outcome = match frame {
                    Ok(frame) => {
                        debug!(buffers = frame.buffers.len(), "transmitting frame");
                        channel.send(frame).await.map_err(ProxyError::from)
                    }
                    Err(err) => Err(err),
                };
                if let Some(done) = done {
                    let _ = done.send(());
                }
                if let Err(err) = &outcome {
                    warn!(error = %err, "send skipped");
                }
                outcome
            }
            .instrument(span),
        );

        SendTicket { sequence, handle }
    }

    async fn wait_prior(&mut self) {
        if let Some(prior) = self.prior.as_mut() {
            let _ = prior.await;
        }
        self.prior = None;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let Some(done) = self.done.take() else {
            return;
        };
        match self.prior.take() {
            None => {
                let _ = done.send(());
            }
            Some(mut prior) => {
                // `done` may only fire once `prior` has.
                if !matches!(prior.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
                    let _ = done.send(());
                } else if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    runtime.spawn(async move {
                        let _ = prior.await;
                        let _ = done.send(());
                    });
                } else {
                    std::thread::spawn(move || {
                        let _ = prior.blocking_recv();
                        let _ = done.send(());
                    });
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------

/// Outcome of one submitted send.
#[derive(Debug)]
pub struct SendTicket {
    sequence: u64,
    handle: JoinHandle<Result<(), ProxyError>>,
}

impl SendTicket {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Waits until the frame has been handed to the channel (or skipped).
    pub async fn transmitted(self) -> Result<(), ProxyError> {
        self.handle.await.map_err(|_| ProxyError::SendAborted)?
    }
}
