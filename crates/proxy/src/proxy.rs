//! The remote proxy: dispatch, batching, queries and branches.
//!
//! A [`RemoteProxy`] is a handle onto one *lineage*: a channel, its send
//! chain, reply ledger, capability cache and reference counter. The root
//! handle is created by [`RemoteProxy::open`]; [`RemoteProxy::branch`] creates
//! further handles on the same lineage that differ only in their batching
//! context.
//!
//! ## Batches
//!
//! [`RemoteProxy::chunk`] runs a synchronous closure with batching enabled on
//! that handle. The outermost chunk takes its place in send order when it
//! opens, so anything sent later (from any handle of the lineage) is
//! transmitted after the batch. Because the closure cannot suspend, a batch is
//! always flushed promptly and no awaited reply can end up queued behind it.
//! The remaining hazard, using the reply of a query issued from a branch
//! *inside* the batch as one of its arguments, is rejected when the argument
//! is added.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use wire::{CommandId, Frame, InboundMessage, LineageId, OutboundMessage, RemoteRef, Target};

use crate::capabilities::{CapabilityCache, CapabilitySet, LookupResult};
use crate::channel::{Channel, Inbound};
use crate::config::ProxyConfig;
use crate::errors::{ProxyError, ReplyError};
use crate::instruction::{Arg, BatchSlot, Dispatch, Instruction, PreparedCall};
use crate::ledger::ReplyLedger;
use crate::reply::{Origin, PendingReply};
use crate::send_chain::{Reservation, SendChain, SendTicket};

const VIOLATION_BACKLOG: usize = 64;

/// A malformed or unrecognised inbound frame, as broadcast to subscribers of
/// [`RemoteProxy::protocol_errors`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolViolation {
    pub message: String,
}

/// State shared by a root proxy and all its branches.
struct Lineage {
    id: LineageId,
    config: ProxyConfig,
    channel: Arc<dyn Channel>,
    chain: SendChain,
    ledger: Arc<ReplyLedger>,
    capabilities: CapabilityCache,
    next_ref: AtomicU64,
    closed: AtomicBool,
    violations: broadcast::Sender<ProtocolViolation>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Lineage {
    fn on_frame(&self, frame: Frame) -> Result<(), ProxyError> {
        match frame.parse_inbound()? {
            InboundMessage::ConstantsReply { data } => {
                self.capabilities.record_constants(data);
            }
            InboundMessage::MethodsReply { data } => {
                self.capabilities.record_methods(data);
            }
            InboundMessage::QueryReply { data } => {
                let id = correlation(&frame, "queryReply")?;
                if !self.ledger.resolve(id, data) {
                    warn!(cmd_id = %id, "discarding reply to unknown or expired query");
                }
            }
            InboundMessage::QueryError { data } => {
                let id = correlation(&frame, "queryError")?;
                let error = ReplyError::Remote {
                    message: data.message,
                };
                if !self.ledger.reject(id, error) {
                    warn!(cmd_id = %id, "discarding error for unknown or expired query");
                }
            }
        }
        Ok(())
    }
}

fn correlation(frame: &Frame, kind: &str) -> Result<CommandId, ProxyError> {
    frame.cmd_id().ok_or_else(|| ProxyError::Protocol {
        message: format!("{kind} without cmd_id"),
    })
}

async fn pump(lineage: Weak<Lineage>, mut inbound: Inbound) {
    while let Some(frame) = inbound.recv().await {
        let Some(lineage) = lineage.upgrade() else {
            return;
        };
        debug!(cmd_id = ?frame.cmd_id(), "frame received");
        if let Err(err) = lineage.on_frame(frame) {
            error!(error = %err, "protocol violation");
            let _ = lineage.violations.send(ProtocolViolation {
                message: err.to_string(),
            });
        }
    }
    if let Some(lineage) = lineage.upgrade() {
        let cancelled = lineage.ledger.cancel_all();
        info!(cancelled, "inbound stream ended");
    }
}

// ---------------------------------------------------------------------------
// Batching state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SlotState {
    op: String,
    call: Option<PreparedCall>,
    /// Set when the call into this slot was rejected; the flush skips it.
    withdrawn: bool,
}

#[derive(Debug, Default)]
struct BatchState {
    depth: usize,
    generation: u64,
    slots: Vec<SlotState>,
    reservation: Option<Reservation>,
}

impl BatchState {
    fn active(&self) -> bool {
        self.depth > 0
    }

    fn reset(&mut self) {
        self.depth = 0;
        self.slots.clear();
        self.reservation = None;
    }
}

/// Unwinds a chunk's depth if its closure panics.
struct ScopeGuard<'a> {
    proxy: &'a RemoteProxy,
    armed: bool,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut batch = self.proxy.batch();
            batch.depth = batch.depth.saturating_sub(1);
            if batch.depth == 0 {
                batch.reset();
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum CommandKind {
    Exec,
    Query,
}

async fn build_frame(
    kind: CommandKind,
    calls: Vec<PreparedCall>,
    cmd_id: Option<CommandId>,
) -> Result<Frame, ProxyError> {
    let mut resolved = Vec::with_capacity(calls.len());
    for call in calls {
        resolved.push(call.resolve().await?);
    }
    let (instructions, buffers) = wire::encode(resolved)?;
    let message = match kind {
        CommandKind::Exec => OutboundMessage::Exec { instructions },
        CommandKind::Query => OutboundMessage::Query { instructions },
    };
    Ok(Frame::outbound(&message, cmd_id, buffers)?)
}

// ---------------------------------------------------------------------------
// RemoteProxy
// ---------------------------------------------------------------------------

/// Host-side handle onto a renderer context.
///
/// Cloning yields another handle with the *same* batching context; use
/// [`RemoteProxy::branch`] for an independent one.
#[derive(Clone)]
pub struct RemoteProxy {
    lineage: Arc<Lineage>,
    batch: Arc<Mutex<BatchState>>,
    is_branch: bool,
}

impl std::fmt::Debug for RemoteProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProxy")
            .field("lineage", &self.lineage.id)
            .field("is_branch", &self.is_branch)
            .finish_non_exhaustive()
    }
}

impl RemoteProxy {
    /// Starts a lineage over `channel` and sends the capability handshake.
    ///
    /// Names resolve only once both handshake replies have arrived; use
    /// [`RemoteProxy::connect`] to wait for that. Must be called from within
    /// a tokio runtime.
    pub fn open(channel: Arc<dyn Channel>, inbound: Inbound, config: ProxyConfig) -> Self {
        let id = LineageId::new_random();
        let (violations, _) = broadcast::channel(VIOLATION_BACKLOG);
        let lineage = Arc::new(Lineage {
            id,
            config,
            chain: SendChain::new(Arc::clone(&channel), id),
            channel,
            ledger: ReplyLedger::new(),
            capabilities: CapabilityCache::default(),
            next_ref: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            violations,
            pump: Mutex::new(None),
        });

        let handle = tokio::spawn(
            pump(Arc::downgrade(&lineage), inbound).instrument(info_span!("pump", lineage = %id)),
        );
        *lineage.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        let proxy = Self {
            lineage,
            batch: Arc::new(Mutex::new(BatchState::default())),
            is_branch: false,
        };
        proxy.request_capabilities();
        info!(lineage = %id, "proxy opened");
        proxy
    }

    /// [`RemoteProxy::open`], then waits for the handshake to complete.
    pub async fn connect(
        channel: Arc<dyn Channel>,
        inbound: Inbound,
        config: ProxyConfig,
    ) -> Result<Self, ProxyError> {
        let limit = config.handshake_timeout();
        let proxy = Self::open(channel, inbound, config);
        proxy.lineage.capabilities.ready(limit).await?;
        Ok(proxy)
    }

    /// Re-runs the handshake and waits for the new capability set.
    ///
    /// The previous set stays in use until the new one is complete.
    pub async fn refresh_capabilities(&self) -> Result<Arc<CapabilitySet>, ProxyError> {
        self.ensure_open()?;
        let limit = self.lineage.config.handshake_timeout();
        let mut published = self.lineage.capabilities.subscribe();
        let _ = published.borrow_and_update();
        self.request_capabilities();
        match tokio::time::timeout(limit, published.changed()).await {
            Ok(Ok(())) => self
                .lineage
                .capabilities
                .snapshot()
                .ok_or(ProxyError::HandshakeTimeout { after: limit }),
            Ok(Err(_)) | Err(_) => Err(ProxyError::HandshakeTimeout { after: limit }),
        }
    }

    fn request_capabilities(&self) {
        self.lineage.capabilities.begin_refresh();
        for message in [
            OutboundMessage::GetConstants {
                target: Target::Context,
            },
            OutboundMessage::GetMethods {
                target: Target::Context,
            },
        ] {
            let _ticket = self
                .lineage
                .chain
                .enqueue(async move {
                    Frame::outbound(&message, None, Vec::new()).map_err(ProxyError::from)
                });
        }
    }

    // -- Introspection ------------------------------------------------------

    pub fn lineage_id(&self) -> LineageId {
        self.lineage.id
    }

    pub fn is_branch(&self) -> bool {
        self.is_branch
    }

    /// The current capability set, or `None` before the handshake completes.
    pub fn capabilities(&self) -> Option<Arc<CapabilitySet>> {
        self.lineage.capabilities.snapshot()
    }

    /// Whether a chunk is open on this handle.
    pub fn in_batch(&self) -> bool {
        self.batch().active()
    }

    /// Number of queries of this lineage still awaiting a reply.
    pub fn outstanding_queries(&self) -> usize {
        self.lineage.ledger.outstanding()
    }

    /// Subscribes to protocol violations detected on inbound frames.
    pub fn protocol_errors(&self) -> broadcast::Receiver<ProtocolViolation> {
        self.lineage.violations.subscribe()
    }

    // -- Dispatch -----------------------------------------------------------

    /// Resolves a capability name.
    ///
    /// Constants are answered from the cache. Methods yield an
    /// [`Instruction`] bound to this handle; inside a chunk it also takes a
    /// slot in the batch.
    pub fn dispatch(&self, name: &str) -> Result<Dispatch, ProxyError> {
        match self.lineage.capabilities.lookup(name)? {
            LookupResult::Constant(value) => Ok(Dispatch::Constant(value)),
            LookupResult::Method => {
                let slot = self.open_slot(name);
                Ok(Dispatch::Method(Instruction::new(
                    self.clone(),
                    name.to_owned(),
                    slot,
                )))
            }
        }
    }

    /// Value of a renderer constant.
    pub fn constant(&self, name: &str) -> Result<serde_json::Value, ProxyError> {
        match self.lineage.capabilities.lookup(name)? {
            LookupResult::Constant(value) => Ok(value),
            LookupResult::Method => Err(ProxyError::UnknownCapability {
                name: name.to_owned(),
            }),
        }
    }

    /// Instruction for a renderer method.
    pub fn method(&self, name: &str) -> Result<Instruction, ProxyError> {
        match self.dispatch(name)? {
            Dispatch::Method(instruction) => Ok(instruction),
            Dispatch::Constant(_) => Err(ProxyError::UnknownCapability {
                name: name.to_owned(),
            }),
        }
    }

    /// Fire-and-forget execution of one operation.
    ///
    /// Inside a chunk the call joins the batch and `None` is returned.
    pub fn exec(&self, name: &str, args: Vec<Arg>) -> Result<Option<SendTicket>, ProxyError> {
        self.method(name)?.call(args)
    }

    /// Like [`RemoteProxy::exec`], keeping the result renderer-side under a
    /// new reference.
    pub fn exec_returning(&self, name: &str, args: Vec<Arg>) -> Result<RemoteRef, ProxyError> {
        self.method(name)?.call_returning(args)
    }

    /// Sends a single-instruction query with the configured default timeout.
    pub fn query(&self, name: &str, args: Vec<Arg>) -> Result<PendingReply, ProxyError> {
        self.query_with_timeout(name, args, self.lineage.config.query_timeout())
    }

    /// Sends a single-instruction query and returns a handle to its reply.
    ///
    /// Not allowed while a chunk is open on this handle: the reply of a
    /// batched query could not be correlated on its own. Query from a
    /// [`RemoteProxy::branch`] instead.
    pub fn query_with_timeout(
        &self,
        name: &str,
        args: Vec<Arg>,
        timeout: Duration,
    ) -> Result<PendingReply, ProxyError> {
        self.ensure_open()?;
        if self.batch().active() {
            return Err(ProxyError::illegal(format!(
                "cannot query '{name}' while a batch is active on this handle"
            )));
        }
        if !matches!(self.lineage.capabilities.lookup(name)?, LookupResult::Method) {
            return Err(ProxyError::UnknownCapability {
                name: name.to_owned(),
            });
        }
        for arg in &args {
            arg.validate()?;
        }

        let reservation = self.lineage.chain.reserve();
        let (id, reply) = self.lineage.ledger.register(timeout);
        let reply = reply.with_origin(Origin {
            lineage: self.lineage.id,
            sequence: reservation.sequence(),
        });
        let call = PreparedCall {
            op: name.to_owned(),
            args,
            ret: None,
        };
        debug!(cmd_id = %id, op = name, sequence = reservation.sequence(), "query queued");
        let ticket = reservation.submit(build_frame(CommandKind::Query, vec![call], Some(id)));

        let ledger = Arc::clone(&self.lineage.ledger);
        tokio::spawn(async move {
            if let Err(err) = ticket.transmitted().await {
                ledger.reject(
                    id,
                    ReplyError::NotSent {
                        reason: err.to_string(),
                    },
                );
            }
        });
        Ok(reply)
    }

    // -- Batching -----------------------------------------------------------

    /// Runs `body` with batching enabled on this handle.
    ///
    /// Every operation issued through this handle inside `body` is collected
    /// and sent as one exec message when the outermost chunk returns `Ok`.
    /// Nested chunks join the outermost batch. If `body` fails, or any
    /// instruction dispatched inside it was never called, nothing is sent.
    pub fn chunk<T, F>(&self, body: F) -> Result<T, ProxyError>
    where
        F: FnOnce(&RemoteProxy) -> Result<T, ProxyError>,
    {
        self.ensure_open()?;
        let outermost = {
            let mut batch = self.batch();
            batch.depth += 1;
            if batch.depth == 1 {
                batch.generation += 1;
                batch.slots.clear();
                batch.reservation = Some(self.lineage.chain.reserve());
            }
            batch.depth == 1
        };

        let mut guard = ScopeGuard {
            proxy: self,
            armed: true,
        };
        let result = body(self);
        guard.armed = false;
        drop(guard);

        if !outermost {
            self.batch().depth -= 1;
            return result;
        }

        let (slots, reservation) = {
            let mut batch = self.batch();
            let slots = std::mem::take(&mut batch.slots);
            let reservation = batch.reservation.take();
            batch.reset();
            (slots, reservation)
        };

        let value = result?;
        let calls = slots
            .into_iter()
            .filter(|slot| !slot.withdrawn)
            .map(|slot| {
                slot.call.ok_or(ProxyError::UnflushedInstruction {
                    operation: slot.op,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if calls.is_empty() {
            return Ok(value);
        }
        if let Some(reservation) = reservation {
            debug!(
                instructions = calls.len(),
                sequence = reservation.sequence(),
                "flushing batch"
            );
            let _ticket = reservation.submit(build_frame(CommandKind::Exec, calls, None));
        }
        Ok(value)
    }

    /// A handle on the same lineage with its own batching context.
    ///
    /// Branches share the channel, capabilities, reply ledger and send
    /// order with their parent. Dropping one never closes the channel.
    pub fn branch(&self) -> RemoteProxy {
        debug!(lineage = %self.lineage.id, "branch created");
        RemoteProxy {
            lineage: Arc::clone(&self.lineage),
            batch: Arc::new(Mutex::new(BatchState::default())),
            is_branch: true,
        }
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Waits until everything sent through this lineage so far has been
    /// handed to the channel.
    pub async fn flushed(&self) {
        self.lineage.chain.barrier().await;
    }

    /// Closes the lineage: cancels every outstanding query, closes the
    /// channel and stops reading inbound frames.
    ///
    /// Returns the number of queries cancelled. Closing twice returns 0.
    pub async fn close(&self) -> Result<usize, ProxyError> {
        if self.is_branch {
            return Err(ProxyError::illegal(
                "branches cannot close the shared channel",
            ));
        }
        if self.lineage.closed.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        let cancelled = self.lineage.ledger.cancel_all();
        self.lineage.channel.close().await;
        let pump = self
            .lineage
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            pump.abort();
        }
        info!(lineage = %self.lineage.id, cancelled, "proxy closed");
        Ok(cancelled)
    }

    pub fn is_closed(&self) -> bool {
        self.lineage.closed.load(Ordering::SeqCst)
    }

    /// Handles one inbound frame as the pump does.
    ///
    /// For transports that deliver frames through a callback rather than the
    /// inbound receiver.
    pub fn on_message(&self, frame: Frame) -> Result<(), ProxyError> {
        self.lineage.on_frame(frame)
    }

    // -- Internals ----------------------------------------------------------

    pub(crate) fn allocate_ref(&self) -> RemoteRef {
        RemoteRef::new(self.lineage.next_ref.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn invoke(
        &self,
        op: String,
        slot: Option<BatchSlot>,
        args: Vec<Arg>,
        ret: Option<RemoteRef>,
    ) -> Result<Option<SendTicket>, ProxyError> {
        let result = self.try_invoke(op, slot, args, ret);
        if let (Err(_), Some(slot)) = (&result, slot) {
            self.withdraw_slot(slot);
        }
        result
    }

    fn try_invoke(
        &self,
        op: String,
        slot: Option<BatchSlot>,
        args: Vec<Arg>,
        ret: Option<RemoteRef>,
    ) -> Result<Option<SendTicket>, ProxyError> {
        self.ensure_open()?;
        for arg in &args {
            arg.validate()?;
        }
        let call = PreparedCall { op, args, ret };

        {
            let mut batch = self.batch();
            if batch.active() {
                self.check_no_circular_wait(&batch, &call)?;
                match slot {
                    None => {
                        batch.slots.push(SlotState {
                            op: call.op.clone(),
                            call: Some(call),
                            withdrawn: false,
                        });
                    }
                    Some(slot) if slot.generation == batch.generation => {
                        if let Some(state) = batch.slots.get_mut(slot.index) {
                            state.call = Some(call);
                        }
                    }
                    Some(_) => return Err(stale_instruction(&call.op)),
                }
                return Ok(None);
            }
        }

        if slot.is_some() {
            return Err(stale_instruction(&call.op));
        }
        debug!(op = %call.op, "exec queued");
        Ok(Some(
            self.lineage
                .chain
                .enqueue(build_frame(CommandKind::Exec, vec![call], None)),
        ))
    }

    fn check_no_circular_wait(
        &self,
        batch: &BatchState,
        call: &PreparedCall,
    ) -> Result<(), ProxyError> {
        let Some(reservation) = &batch.reservation else {
            return Ok(());
        };
        let queued_behind = call
            .args
            .iter()
            .filter_map(Arg::as_pending)
            .filter_map(PendingReply::origin)
            .any(|origin| {
                origin.lineage == self.lineage.id && origin.sequence > reservation.sequence()
            });
        if queued_behind {
            return Err(ProxyError::illegal(format!(
                "argument of '{}' is the reply to a query sent after this batch; \
                 the batch would wait for it forever",
                call.op
            )));
        }
        Ok(())
    }

    fn open_slot(&self, op: &str) -> Option<BatchSlot> {
        let mut batch = self.batch();
        if !batch.active() {
            return None;
        }
        batch.slots.push(SlotState {
            op: op.to_owned(),
            call: None,
            withdrawn: false,
        });
        Some(BatchSlot {
            generation: batch.generation,
            index: batch.slots.len() - 1,
        })
    }

    fn withdraw_slot(&self, slot: BatchSlot) {
        let mut batch = self.batch();
        if batch.active() && slot.generation == batch.generation {
            if let Some(state) = batch.slots.get_mut(slot.index) {
                debug!(op = %state.op, "batch slot withdrawn");
                state.withdrawn = true;
            }
        }
    }

    fn ensure_open(&self) -> Result<(), ProxyError> {
        if self.is_closed() {
            return Err(ProxyError::Closed);
        }
        Ok(())
    }

    fn batch(&self) -> MutexGuard<'_, BatchState> {
        self.batch.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn stale_instruction(op: &str) -> ProxyError {
    ProxyError::illegal(format!(
        "instruction '{op}' was dispatched in a batch that has already been flushed"
    ))
}
