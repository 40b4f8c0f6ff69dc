//! Runtime configuration for a proxy lineage.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_QUERY_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Timeouts applied by [`crate::RemoteProxy`].
///
/// Missing fields take their defaults, so an empty `[proxy]` table is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Bound for a query reply when the caller does not pass one.
    pub query_timeout_ms: u64,
    /// Bound for the constants/methods handshake in `RemoteProxy::connect`.
    pub handshake_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
        }
    }
}

impl ProxyConfig {
    /// [`ProxyConfig::query_timeout_ms`] as a [`Duration`].
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// [`ProxyConfig::handshake_timeout_ms`] as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}
