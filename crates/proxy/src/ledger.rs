//! Query/reply correlation.
//!
//! Every query is registered under a fresh [`CommandId`] that travels as
//! `cmd_id` in the frame metadata and is echoed by the renderer. Lookup is by
//! id, so replies may arrive in any order. The send path is ordered by the
//! send chain; the reply path has no such guarantee from a remote peer.
//!
//! Each registration arms a timer. When it fires first, the entry is removed
//! and the reply rejected with [`ReplyError::Timeout`]; a reply arriving
//! afterwards finds no entry and is discarded by the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};
use wire::CommandId;

use crate::errors::ReplyError;
use crate::reply::{Outcome, PendingReply, ReplyResolver};

/// Outstanding queries of one proxy lineage.
#[derive(Debug)]
pub struct ReplyLedger {
    next_id: AtomicU64,
    pending: Mutex<HashMap<CommandId, ReplyResolver>>,
}

impl Default for ReplyLedger {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl ReplyLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a query and arms its timeout.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(self: &Arc<Self>, timeout: Duration) -> (CommandId, PendingReply) {
        let id = CommandId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (resolver, reply) = PendingReply::channel();
        let mut settled = resolver.subscribe();
        self.entries().insert(id, resolver);
        debug!(cmd_id = %id, ?timeout, "query registered");

        // A timeout past the clock's range never fires: no timer is armed.
        if let Some(deadline) = Instant::now().checked_add(timeout) {
            let ledger = Arc::downgrade(self);
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        if let Some(ledger) = ledger.upgrade() {
                            ledger.expire(id, timeout);
                        }
                    }
                    _ = settled.wait_for(Option::is_some) => {}
                }
            });
        }

        (id, reply.for_command(id))
    }

    /// Settles query `id` with a value. Returns `false` if it is not outstanding.
    pub fn resolve(&self, id: CommandId, value: Value) -> bool {
        self.settle(id, Ok(value))
    }

    /// Settles query `id` with an error. Returns `false` if it is not outstanding.
    pub fn reject(&self, id: CommandId, error: ReplyError) -> bool {
        self.settle(id, Err(error))
    }

    /// Rejects query `id` with [`ReplyError::Timeout`] if still outstanding.
    pub fn expire(&self, id: CommandId, after: Duration) -> bool {
        let expired = self.reject(id, ReplyError::Timeout { command: id, after });
        if expired {
            warn!(cmd_id = %id, ?after, "query timed out");
        }
        expired
    }

    /// Rejects every outstanding query with [`ReplyError::Cancelled`].
    ///
    /// Returns how many were cancelled; zero when nothing is pending.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.entries().drain().collect();
        let count = drained.len();
        for (_, resolver) in drained {
            resolver.settle(Err(ReplyError::Cancelled));
        }
        if count > 0 {
            debug!(count, "outstanding queries cancelled");
        }
        count
    }

    /// Number of queries awaiting a reply.
    pub fn outstanding(&self) -> usize {
        self.entries().len()
    }

    /// Waits for the reply to query `id` for at most `limit`.
    ///
    /// On expiry the query is removed and rejected for every holder, exactly
    /// as if its own timer had fired.
    pub async fn await_reply(&self, id: CommandId, limit: Duration) -> Result<Value, ReplyError> {
        let mut rx = self
            .entries()
            .get(&id)
            .map(ReplyResolver::subscribe)
            .ok_or(ReplyError::Unknown { command: id })?;

        let settled = match tokio::time::timeout(limit, rx.wait_for(Option::is_some)).await {
            Ok(Ok(state)) => Some(state.clone().unwrap_or(Err(ReplyError::Cancelled))),
            Ok(Err(_)) => Some(Err(ReplyError::Cancelled)),
            Err(_) => None,
        };
        if let Some(outcome) = settled {
            return outcome;
        }
        // Settled between the deadline and now.
        if let Some(outcome) = rx.borrow().clone() {
            return outcome;
        }
        self.expire(id, limit);
        Err(ReplyError::Timeout {
            command: id,
            after: limit,
        })
    }

    fn settle(&self, id: CommandId, outcome: Outcome) -> bool {
        let resolver = self.entries().remove(&id);
        match resolver {
            Some(resolver) => resolver.settle(outcome),
            None => false,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<CommandId, ReplyResolver>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
