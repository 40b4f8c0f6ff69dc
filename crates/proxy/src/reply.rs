//! Pending query results.
//!
//! A [`PendingReply`] is a cheap, clonable view of a value that will arrive
//! later. Any number of holders may await it, and it may be passed as an
//! instruction argument (the send chain awaits it before encoding). The
//! matching [`ReplyResolver`] settles it exactly once.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use wire::{CommandId, LineageId};

use crate::errors::ReplyError;

pub(crate) type Outcome = Result<Value, ReplyError>;

/// Position of the query that produces a reply within its lineage's send
/// chain. Used to detect batches that would wait on their own successors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Origin {
    pub lineage: LineageId,
    pub sequence: u64,
}

/// Handle to a result that is not available yet.
#[derive(Debug, Clone)]
pub struct PendingReply {
    rx: watch::Receiver<Option<Outcome>>,
    command: Option<CommandId>,
    origin: Option<Origin>,
}

/// Settles the [`PendingReply`] it was created with.
///
/// Dropping an unsettled resolver settles every holder with
/// [`ReplyError::Cancelled`].
#[derive(Debug)]
pub struct ReplyResolver {
    tx: watch::Sender<Option<Outcome>>,
}

impl PendingReply {
    /// Creates a host-resolved pending value.
    ///
    /// Useful for feeding values computed elsewhere on the host into
    /// instructions without blocking the caller.
    pub fn channel() -> (ReplyResolver, PendingReply) {
        let (tx, rx) = watch::channel(None);
        (
            ReplyResolver { tx },
            PendingReply {
                rx,
                command: None,
                origin: None,
            },
        )
    }

    pub(crate) fn for_command(mut self, command: CommandId) -> Self {
        self.command = Some(command);
        self
    }

    pub(crate) fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub(crate) fn origin(&self) -> Option<Origin> {
        self.origin
    }

    /// The command id of the query producing this value, if any.
    pub fn command_id(&self) -> Option<CommandId> {
        self.command
    }

    /// Returns the outcome if the reply has already been settled.
    pub fn try_outcome(&self) -> Option<Result<Value, ReplyError>> {
        self.rx.borrow().clone()
    }

    /// Waits for the reply.
    pub async fn wait(&self) -> Result<Value, ReplyError> {
        let mut rx = self.rx.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(state) => state.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(ReplyError::Cancelled))
    }

    /// Waits for the reply for at most `limit`.
    ///
    /// Returns `None` if the limit elapses first. This is a local wait only:
    /// the query stays registered and keeps its own timeout.
    pub async fn wait_timeout(&self, limit: Duration) -> Option<Result<Value, ReplyError>> {
        tokio::time::timeout(limit, self.wait()).await.ok()
    }
}

impl IntoFuture for PendingReply {
    type Output = Result<Value, ReplyError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}

impl ReplyResolver {
    /// Settles with a value.
    pub fn resolve(self, value: Value) {
        self.settle(Ok(value));
    }

    /// Settles with an error.
    pub fn reject(self, error: ReplyError) {
        self.settle(Err(error));
    }

    /// Settles unless already settled. Returns whether this call settled it.
    pub(crate) fn settle(&self, outcome: Outcome) -> bool {
        self.tx.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(outcome);
            true
        })
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<Outcome>> {
        self.tx.subscribe()
    }
}
