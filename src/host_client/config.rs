//! Host client configuration.
//!
//! A small struct of optional-with-defaults fields, constructed via `..
//! Default::default()` or the builder methods below.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::id::{DefaultTxIdGenerator, TxIdGenerator};
use crate::connection::ConnectRetryPolicy;
use crate::policy::RetryPolicy;

/// Reserved timeout-table key bounding the connect phase.
pub const WORKER_STARTUP: &str = "WORKER_STARTUP";
/// Reserved timeout-table key, the fallback for message types with no
/// specific entry.
pub const WORKER_MESSAGE: &str = "WORKER_MESSAGE";
/// Reserved timeout-table key passed to the worker server as its
/// accept-phase deadline.
pub const SERVER_CONNECT: &str = "SERVER_CONNECT";

const DEFAULT_WORKER_STARTUP: Duration = Duration::from_secs(10);
const DEFAULT_WORKER_MESSAGE: Duration = Duration::from_secs(300);
const DEFAULT_SERVER_CONNECT: Duration = Duration::from_secs(30);

/// Configuration for a [`HostClient`](super::HostClient).
pub struct HostClientConfig {
    /// Per-message-type timeout overrides, plus the three reserved keys
    /// (`WORKER_STARTUP`, `WORKER_MESSAGE`, `SERVER_CONNECT`).
    pub timeouts: HashMap<String, Duration>,
    /// Connect retry policy (attempts, schedule, per-attempt deadline).
    pub connect_retry: ConnectRetryPolicy,
    /// Shutdown/retry policy: reject vs. bounded-retry per message type.
    pub retry_policy: RetryPolicy,
    /// Generator for transaction ids.
    pub tx_id_generator: Arc<dyn TxIdGenerator>,
}

impl Default for HostClientConfig {
    fn default() -> Self {
        let mut timeouts = HashMap::new();
        timeouts.insert(WORKER_STARTUP.to_string(), DEFAULT_WORKER_STARTUP);
        timeouts.insert(WORKER_MESSAGE.to_string(), DEFAULT_WORKER_MESSAGE);
        timeouts.insert(SERVER_CONNECT.to_string(), DEFAULT_SERVER_CONNECT);
        Self {
            timeouts,
            connect_retry: ConnectRetryPolicy::default(),
            retry_policy: RetryPolicy::default(),
            tx_id_generator: Arc::new(DefaultTxIdGenerator::new()),
        }
    }
}

impl HostClientConfig {
    /// Set (or override) the timeout for a specific message type.
    pub fn with_timeout(mut self, message_type: impl Into<String>, timeout: Duration) -> Self {
        self.timeouts.insert(message_type.into(), timeout);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_tx_id_generator(mut self, generator: Arc<dyn TxIdGenerator>) -> Self {
        self.tx_id_generator = generator;
        self
    }

    /// Effective timeout for a message of type `kind`: the table entry for
    /// `kind` if present, else `WORKER_MESSAGE`, else the hard default of
    /// 300s.
    pub fn effective_timeout(&self, kind: &str) -> Duration {
        self.timeouts
            .get(kind)
            .or_else(|| self.timeouts.get(WORKER_MESSAGE))
            .copied()
            .unwrap_or(DEFAULT_WORKER_MESSAGE)
    }

    pub fn worker_startup_timeout(&self) -> Duration {
        self.timeouts
            .get(WORKER_STARTUP)
            .copied()
            .unwrap_or(DEFAULT_WORKER_STARTUP)
    }

    pub fn server_connect_timeout(&self) -> Duration {
        self.timeouts
            .get(SERVER_CONNECT)
            .copied()
            .unwrap_or(DEFAULT_SERVER_CONNECT)
    }
}
