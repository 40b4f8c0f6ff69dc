//! Newtype identifiers used on the command channel.
//!
//! Every value that names something across the host/renderer boundary is a
//! distinct newtype wrapping a primitive. This prevents accidentally passing a
//! [`CommandId`] where a [`RemoteRef`] is expected even though both are `u64`
//! under the hood.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for u64-wrapped newtypes.
// Generates: struct (Copy), new(), as_u64(), Display.
// ---------------------------------------------------------------------------
macro_rules! u64_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new identifier from a raw integer.
            pub fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the underlying integer value.
            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

u64_id! {
    /// Correlates a query message with the reply the renderer sends back.
    ///
    /// Carried as `cmd_id` in the frame metadata in both directions. Allocated
    /// by the reply ledger of one proxy lineage; never reused within it.
    CommandId
}

u64_id! {
    /// Opaque handle to an object living in the renderer.
    ///
    /// The host allocates the number and asks the renderer to store an
    /// operation's result under it (see `SerializedInstruction::ret`); later
    /// instructions pass the handle back as `{"__ref__": id}`.
    RemoteRef
}

/// JSON key marking an argument object as a [`RemoteRef`].
pub const REF_KEY: &str = "__ref__";

impl RemoteRef {
    /// Returns the argument form of this reference: `{"__ref__": id}`.
    pub fn to_json(self) -> Value {
        let mut map = serde_json::Map::with_capacity(1);
        map.insert(REF_KEY.to_owned(), Value::from(self.0));
        Value::Object(map)
    }

    /// Recognises the argument form produced by [`RemoteRef::to_json`].
    ///
    /// Returns `None` for anything else, including objects that carry extra
    /// keys next to `__ref__`.
    pub fn from_json(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        if map.len() != 1 {
            return None;
        }
        map.get(REF_KEY)?.as_u64().map(Self)
    }
}

// ---------------------------------------------------------------------------

/// Identifies one proxy lineage: a root proxy together with all its branches.
///
/// Generated fresh for every root proxy; recorded on tracing spans so the
/// traffic of concurrent lineages can be told apart in the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineageId(Uuid);

impl LineageId {
    /// Generates a new random lineage identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying [`Uuid`].
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for LineageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
