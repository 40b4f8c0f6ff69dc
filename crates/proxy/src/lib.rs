//! Host-side remote proxy for GlBridge.
//!
//! A [`RemoteProxy`] lets host code drive a graphics context that lives in a
//! separate renderer process as if it were local. Calls become instructions
//! on an ordered command channel; results come back asynchronously and are
//! matched to their queries by command id.
//!
//! ## Architectural Layer
//!
//! **Application.** This crate owns ordering, correlation, batching and
//! capability discovery. The wire format lives in the `wire` crate; the
//! transport is supplied by the caller through the [`Channel`] trait.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`proxy`] | `RemoteProxy`: dispatch, exec, query, chunk, branch, close |
//! | [`send_chain`] | Initiation-ordered sends (`SendChain`, `Reservation`, `SendTicket`) |
//! | [`ledger`] | `ReplyLedger`: command ids, timeouts, cancellation |
//! | [`reply`] | `PendingReply` and its `ReplyResolver` |
//! | [`instruction`] | `Arg`, `Instruction`, `Dispatch`, the `args!` macro |
//! | [`capabilities`] | `CapabilityCache` and the published `CapabilitySet` |
//! | [`channel`] | `Channel` trait and the in-memory transport |
//! | [`helpers`] | Shader/program setup (`ensure_shader`, `make_program`, ...) |
//! | [`loopback`] | `StubRenderer`, an in-process renderer peer |
//! | [`config`] | `ProxyConfig` |
//! | [`errors`] | `ProxyError`, `ReplyError` |

pub mod capabilities;
pub mod channel;
pub mod config;
pub mod errors;
pub mod helpers;
pub mod instruction;
pub mod ledger;
pub mod loopback;
pub mod proxy;
pub mod reply;
pub mod send_chain;

pub use capabilities::{Capability, CapabilityCache, CapabilitySet, LookupResult};
pub use channel::{memory_channel, Channel, ChannelError, Inbound, MemoryChannel, PeerEndpoint};
pub use config::ProxyConfig;
pub use errors::{ProxyError, ReplyError};
pub use helpers::{ensure_program, ensure_shader, make_program, make_shader, ShaderKind};
pub use instruction::{Arg, Dispatch, Instruction};
pub use ledger::ReplyLedger;
pub use loopback::{QueryHandler, Received, ReceivedKind, ReceivedLog, StubRenderer};
pub use proxy::{ProtocolViolation, RemoteProxy};
pub use reply::{PendingReply, ReplyResolver};
pub use send_chain::{Reservation, SendChain, SendTicket};

pub use wire::{ArgValue, BinaryArray, CommandId, ElementType, Frame, RemoteRef};
