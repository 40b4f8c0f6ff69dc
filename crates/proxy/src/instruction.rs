//! Instruction arguments and bound instructions.

use serde_json::Value;
use wire::{ArgValue, BinaryArray, RemoteRef, ResolvedInstruction};

use crate::errors::ProxyError;
use crate::proxy::RemoteProxy;
use crate::reply::PendingReply;
use crate::send_chain::SendTicket;

/// An instruction argument: either available now or the pending reply of an
/// earlier query.
#[derive(Debug, Clone)]
pub enum Arg {
    Ready(ArgValue),
    Pending(PendingReply),
}

impl Arg {
    /// Rejects values with no wire representation before anything is queued.
    pub fn validate(&self) -> Result<(), ProxyError> {
        match self {
            Self::Ready(value) => value.validate().map_err(ProxyError::from),
            Self::Pending(_) => Ok(()),
        }
    }

    pub(crate) fn as_pending(&self) -> Option<&PendingReply> {
        match self {
            Self::Pending(reply) => Some(reply),
            Self::Ready(_) => None,
        }
    }

    async fn resolve(self) -> Result<ArgValue, ProxyError> {
        match self {
            Self::Ready(value) => Ok(value),
            Self::Pending(reply) => Ok(ArgValue::Json(reply.wait().await?)),
        }
    }
}

macro_rules! ready_arg_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Arg {
                fn from(value: $ty) -> Self {
                    Self::Ready(ArgValue::from(value))
                }
            }
        )*
    };
}

ready_arg_from!(
    bool, i32, i64, u32, u64, usize, f32, f64, String, &str, Value, BinaryArray, RemoteRef,
    &RemoteRef,
);

impl From<ArgValue> for Arg {
    fn from(value: ArgValue) -> Self {
        Self::Ready(value)
    }
}

impl From<PendingReply> for Arg {
    fn from(reply: PendingReply) -> Self {
        Self::Pending(reply)
    }
}

impl From<&PendingReply> for Arg {
    fn from(reply: &PendingReply) -> Self {
        Self::Pending(reply.clone())
    }
}

/// Builds a `Vec<Arg>` from heterogeneous values.
///
/// ```ignore
/// gl.exec("uniform2f", args![location, 0.5, 1.0])?;
/// ```
#[macro_export]
macro_rules! args {
    () => {
        ::std::vec::Vec::<$crate::Arg>::new()
    };
    ($($arg:expr),+ $(,)?) => {
        ::std::vec![$($crate::Arg::from($arg)),+]
    };
}

// ---------------------------------------------------------------------------

/// An invoked instruction waiting for its arguments to resolve.
#[derive(Debug, Clone)]
pub(crate) struct PreparedCall {
    pub op: String,
    pub args: Vec<Arg>,
    pub ret: Option<RemoteRef>,
}

impl PreparedCall {
    pub(crate) async fn resolve(self) -> Result<ResolvedInstruction, ProxyError> {
        let mut args = Vec::with_capacity(self.args.len());
        for arg in self.args {
            args.push(arg.resolve().await?);
        }
        Ok(ResolvedInstruction {
            op: self.op,
            args,
            ret: self.ret,
        })
    }
}

/// Position of an instruction inside a batch generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BatchSlot {
    pub generation: u64,
    pub index: usize,
}

/// Result of [`RemoteProxy::dispatch`].
#[derive(Debug)]
pub enum Dispatch {
    /// A renderer constant, answered from the cache without channel traffic.
    Constant(Value),
    /// A callable operation bound to the dispatching proxy.
    Method(Instruction),
}

/// A remote operation bound to a proxy, waiting to be called.
///
/// Dispatched inside a batch, the instruction owns a slot in that batch; a
/// batch flushed with an uncalled slot fails with
/// [`ProxyError::UnflushedInstruction`].
#[derive(Debug)]
#[must_use = "an uncalled instruction fails its batch at flush time"]
pub struct Instruction {
    proxy: RemoteProxy,
    op: String,
    slot: Option<BatchSlot>,
}

impl Instruction {
    pub(crate) fn new(proxy: RemoteProxy, op: String, slot: Option<BatchSlot>) -> Self {
        Self { proxy, op, slot }
    }

    pub fn name(&self) -> &str {
        &self.op
    }

    /// Executes the operation.
    ///
    /// Returns the send ticket when the instruction went out on its own, or
    /// `None` when it was added to the active batch.
    pub fn call(self, args: Vec<Arg>) -> Result<Option<SendTicket>, ProxyError> {
        self.proxy.invoke(self.op, self.slot, args, None)
    }

    /// Executes the operation and has the renderer keep its result under a
    /// fresh reference, usable as an argument right away.
    pub fn call_returning(self, args: Vec<Arg>) -> Result<RemoteRef, ProxyError> {
        let ret = self.proxy.allocate_ref();
        self.proxy.invoke(self.op, self.slot, args, Some(ret))?;
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn args_macro_converts_each_value() {
        let (_resolver, reply) = PendingReply::channel();
        let args = crate::args![1, 0.5, "x", RemoteRef::new(2), &reply, json!([1])];
        assert_eq!(args.len(), 6);
        assert!(matches!(args[0], Arg::Ready(ArgValue::Json(_))));
        assert!(matches!(args[1], Arg::Ready(ArgValue::Float(_))));
        assert!(matches!(args[3], Arg::Ready(ArgValue::Ref(_))));
        assert!(matches!(args[4], Arg::Pending(_)));
        assert!(crate::args![].is_empty());
    }

    #[tokio::test]
    async fn pending_arguments_resolve_to_json() {
        let (resolver, reply) = PendingReply::channel();
        resolver.resolve(json!(7));
        let call = PreparedCall {
            op: "uniform1i".into(),
            args: vec![reply.into(), 1.into()],
            ret: None,
        };
        let resolved = call.resolve().await.unwrap();
        assert_eq!(resolved.args, vec![ArgValue::Json(json!(7)), ArgValue::Json(json!(1))]);
    }

    #[tokio::test]
    async fn failed_dependency_fails_resolution() {
        let (resolver, reply) = PendingReply::channel();
        drop(resolver);
        let call = PreparedCall {
            op: "uniform1i".into(),
            args: vec![reply.into()],
            ret: None,
        };
        assert!(matches!(call.resolve().await, Err(ProxyError::Reply(_))));
    }

    #[test]
    fn nan_is_rejected_up_front() {
        assert!(matches!(
            Arg::from(f32::NAN).validate(),
            Err(ProxyError::InvalidArgument { .. })
        ));
    }
}
