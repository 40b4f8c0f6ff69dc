//! Capabilities discovered from the renderer.
//!
//! The handshake asks the renderer for its constants and its callable
//! operations. The two replies arrive as separate messages; the cache stages
//! them and publishes a complete [`CapabilitySet`] only once both are in, so
//! no dispatch ever sees constants without methods or the other way round.
//! A refresh stages a new pair while the previous set stays visible.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::info;

use crate::errors::ProxyError;

/// What a capability name resolves to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Capability<'a> {
    /// A constant and its cached value.
    Constant(&'a Value),
    /// A callable operation.
    Method,
}

/// Constants and operation names of one renderer context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilitySet {
    constants: HashMap<String, Value>,
    methods: HashSet<String>,
}

impl CapabilitySet {
    pub fn new(constants: HashMap<String, Value>, methods: HashSet<String>) -> Self {
        Self { constants, methods }
    }

    /// Resolves `name`; constants take precedence over methods.
    pub fn lookup(&self, name: &str) -> Result<Capability<'_>, ProxyError> {
        if let Some(value) = self.constants.get(name) {
            return Ok(Capability::Constant(value));
        }
        if self.methods.contains(name) {
            return Ok(Capability::Method);
        }
        Err(ProxyError::UnknownCapability {
            name: name.to_owned(),
        })
    }

    /// Value of constant `name`, if known.
    pub fn constant(&self, name: &str) -> Option<&Value> {
        self.constants.get(name)
    }

    /// Whether `name` is a callable operation.
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains(name)
    }

    pub fn constants(&self) -> &HashMap<String, Value> {
        &self.constants
    }

    pub fn methods(&self) -> &HashSet<String> {
        &self.methods
    }
}

#[derive(Debug, Default)]
struct Staging {
    constants: Option<HashMap<String, Value>>,
    methods: Option<HashSet<String>>,
}

/// Shared, atomically published [`CapabilitySet`].
///
/// Only the inbound handshake handlers write to it.
#[derive(Debug)]
pub struct CapabilityCache {
    staging: Mutex<Staging>,
    published: watch::Sender<Option<Arc<CapabilitySet>>>,
}

impl Default for CapabilityCache {
    fn default() -> Self {
        let (published, _) = watch::channel(None);
        Self {
            staging: Mutex::new(Staging::default()),
            published,
        }
    }
}

impl CapabilityCache {
    /// The current set, or `None` before the first handshake completes.
    pub fn snapshot(&self) -> Option<Arc<CapabilitySet>> {
        self.published.borrow().clone()
    }

    /// Resolves `name` against the current set.
    ///
    /// Before the handshake completes every name is unknown.
    pub fn lookup(&self, name: &str) -> Result<LookupResult, ProxyError> {
        let set = self.snapshot().ok_or_else(|| ProxyError::UnknownCapability {
            name: name.to_owned(),
        })?;
        match set.lookup(name)? {
            Capability::Constant(value) => Ok(LookupResult::Constant(value.clone())),
            Capability::Method => Ok(LookupResult::Method),
        }
    }

    /// Records a `constantsReply`.
    pub fn record_constants(&self, constants: Map<String, Value>) {
        let mut staging = self.staging();
        staging.constants = Some(constants.into_iter().collect());
        self.publish_if_complete(&mut staging);
    }

    /// Records a `methodsReply`.
    pub fn record_methods(&self, methods: Vec<String>) {
        let mut staging = self.staging();
        staging.methods = Some(methods.into_iter().collect());
        self.publish_if_complete(&mut staging);
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<Arc<CapabilitySet>>> {
        self.published.subscribe()
    }

    /// Drops any half-received handshake before a new one starts.
    pub(crate) fn begin_refresh(&self) {
        *self.staging() = Staging::default();
    }

    /// Waits until a set has been published.
    pub async fn ready(&self, limit: Duration) -> Result<Arc<CapabilitySet>, ProxyError> {
        let mut rx = self.published.subscribe();
        let waited = tokio::time::timeout(limit, rx.wait_for(Option::is_some)).await;
        match waited {
            Ok(Ok(set)) => set
                .clone()
                .ok_or(ProxyError::HandshakeTimeout { after: limit }),
            Ok(Err(_)) | Err(_) => Err(ProxyError::HandshakeTimeout { after: limit }),
        }
    }

    fn publish_if_complete(&self, staging: &mut Staging) {
        if staging.constants.is_none() || staging.methods.is_none() {
            return;
        }
        let constants = staging.constants.take().unwrap_or_default();
        let methods = staging.methods.take().unwrap_or_default();
        info!(
            constants = constants.len(),
            methods = methods.len(),
            "capabilities published"
        );
        self.published
            .send_replace(Some(Arc::new(CapabilitySet::new(constants, methods))));
    }

    fn staging(&self) -> MutexGuard<'_, Staging> {
        self.staging.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owned result of [`CapabilityCache::lookup`].
#[derive(Debug, Clone, PartialEq)]
pub enum LookupResult {
    /// A constant and its value.
    Constant(Value),
    /// A callable operation.
    Method,
}
