//! The host-side pending-request table.
//!
//! A single-owner `HashMap` guarded by a short-held mutex, with a one-shot
//! resolver per entry. An entry is created at `send`, and consumed by
//! exactly one of: a matching response, a local timeout, a connection
//! close/crash event, or `close()`.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

use crate::error::ClientError;

/// One outstanding request awaiting its response or failure.
pub struct PendingEntry {
    pub tx: String,
    pub kind: String,
    pub payload: Value,
    pub started_at: Instant,
    pub deadline: Instant,
    pub retry_budget_remaining: u32,
    resolver: oneshot::Sender<Result<Value, ClientError>>,
}

pub struct PendingTable {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a fresh pending entry, returning the receiver half the
    /// caller of `send` awaits.
    pub async fn insert(
        &self,
        tx: String,
        kind: String,
        payload: Value,
        deadline: Instant,
        retry_budget_remaining: u32,
    ) -> oneshot::Receiver<Result<Value, ClientError>> {
        let (resolver, receiver) = oneshot::channel();
        let entry = PendingEntry {
            tx: tx.clone(),
            kind,
            payload,
            started_at: Instant::now(),
            deadline,
            retry_budget_remaining,
            resolver,
        };
        let mut guard = self.entries.lock().await;
        guard.insert(tx, entry);
        receiver
    }

    /// Remove and resolve the entry for `tx`, if one exists. The entry is
    /// removed *before* its resolver is invoked.
    pub async fn resolve(&self, tx: &str, outcome: Result<Value, ClientError>) -> bool {
        let entry = {
            let mut guard = self.entries.lock().await;
            guard.remove(tx)
        };
        match entry {
            Some(entry) => {
                let _ = entry.resolver.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Remove an entry without resolving it (used when the caller will
    /// resolve it itself, e.g. after a failed write).
    pub async fn remove(&self, tx: &str) -> Option<PendingEntry> {
        self.entries.lock().await.remove(tx)
    }

    /// Drain every pending entry (used by the shutdown/retry policy engine
    /// and by `close()`).
    pub async fn drain(&self) -> Vec<PendingEntry> {
        let mut guard = self.entries.lock().await;
        guard.drain().map(|(_, v)| v).collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Re-insert a drained entry under a fresh `tx` (retry replay).
    pub async fn reinsert(&self, tx: String, entry: PendingEntry) {
        let mut guard = self.entries.lock().await;
        guard.insert(tx, entry);
    }
}

impl PendingEntry {
    pub fn fail(self, err: ClientError) {
        let _ = self.resolver.send(Err(err));
    }

    pub fn rekey(self, new_tx: String) -> (String, Self) {
        let entry = PendingEntry {
            tx: new_tx.clone(),
            kind: self.kind,
            payload: self.payload,
            started_at: self.started_at,
            deadline: self.deadline,
            retry_budget_remaining: self.retry_budget_remaining.saturating_sub(1),
            resolver: self.resolver,
        };
        (new_tx, entry)
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}
