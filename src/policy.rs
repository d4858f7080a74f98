//! Shutdown/retry policy engine.
//!
//! On a worker-termination event, every pending entry is classified by its
//! message type's strategy: `reject` fails it immediately with
//! [`ClientError::WorkerCrashed`]; `retry` replays it (with a fresh `tx`, on
//! a freshly respawned worker) until its budget is exhausted.

use std::collections::HashMap;

/// Per-message-type (or default) shutdown behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Fail immediately; no replay.
    Reject,
    /// Respawn the worker and replay, up to `attempts` total tries.
    Retry { attempts: u32 },
}

impl Strategy {
    /// The maximum number of attempts this strategy allows (1 for `Reject`).
    pub fn max_attempts(&self) -> u32 {
        match self {
            Strategy::Reject => 1,
            Strategy::Retry { attempts } => *attempts,
        }
    }
}

/// `{strategy: reject}` or `{strategy: retry, attempts: N}` plus a
/// per-message-type override table of the same shape.
#[derive(Clone)]
pub struct RetryPolicy {
    pub default: Strategy,
    pub overrides: HashMap<String, Strategy>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            default: Strategy::Reject,
            overrides: HashMap::new(),
        }
    }
}

impl RetryPolicy {
    pub fn with_override(mut self, message_type: impl Into<String>, strategy: Strategy) -> Self {
        self.overrides.insert(message_type.into(), strategy);
        self
    }

    /// Look up the strategy for `kind`, falling back to the default.
    pub fn strategy_for(&self, kind: &str) -> Strategy {
        self.overrides.get(kind).copied().unwrap_or(self.default)
    }
}
