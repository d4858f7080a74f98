//! Connect retry schedule.

use std::sync::Arc;
use std::time::Duration;

/// Produces the delay to wait before the next connect attempt.
pub trait RetrySchedule: Send + Sync + 'static {
    fn delay(&self, attempt: u32) -> Duration;
}

/// Fixed-delay schedule, capped at `cap`. The default is 100ms capped at 5s.
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff {
    pub delay: Duration,
    pub cap: Duration,
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(100),
            cap: Duration::from_secs(5),
        }
    }
}

impl RetrySchedule for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.delay.min(self.cap)
    }
}

/// Governs the host's connection-establishment retry behavior.
#[derive(Clone)]
pub struct ConnectRetryPolicy {
    /// Total number of attempts, including the first (default 5).
    pub max_attempts: u32,
    /// Per-attempt deadline (default 10s).
    pub attempt_deadline: Duration,
    /// Delay schedule applied between attempts.
    pub schedule: Arc<dyn RetrySchedule>,
}

impl Default for ConnectRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            attempt_deadline: Duration::from_secs(10),
            schedule: Arc::new(FixedBackoff::default()),
        }
    }
}
