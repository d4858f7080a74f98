//! Transaction id generation.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

/// Produces `tx` strings unique within the lifetime of a single connection.
///
/// Callers may substitute their own generator via
/// [`HostClientConfig::tx_id_generator`](super::config::HostClientConfig).
pub trait TxIdGenerator: Send + Sync + 'static {
    fn next(&self) -> String;
}

/// The default generator: a random prefix (fixed for the life of the
/// generator) combined with a monotonically increasing counter, mirroring
/// an atomic sequence counter.
pub struct DefaultTxIdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl DefaultTxIdGenerator {
    pub fn new() -> Self {
        let prefix: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        Self {
            prefix,
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for DefaultTxIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl TxIdGenerator for DefaultTxIdGenerator {
    fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.prefix)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generates_unique_ids() {
        let gen = DefaultTxIdGenerator::new();
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(gen.next()));
        }
    }
}
