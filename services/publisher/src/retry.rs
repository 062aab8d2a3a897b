//! Retry delays and the single-shot retry timer.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Upload retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    /// Consecutive failed attempts tolerated for one chunk. The failure that
    /// reaches this count is final.
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Delay before retry attempt `attempt` (1-based): `initial * (1 + attempt)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.initial_delay.saturating_mul(attempt.saturating_add(1))
    }

    pub fn backoff(&self) -> LinearBackoff {
        LinearBackoff {
            policy: *self,
            attempt: 0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_retries: 5,
        }
    }
}

/// Linearly growing, bounded backoff.
///
/// Growth is linear on purpose: the uplink is slow and a chunk that keeps
/// failing should not be pushed minutes into the future.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl LinearBackoff {
    /// Retry attempts handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

impl Backoff for LinearBackoff {
    fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Called after each failed attempt; `None` once the failure count
    /// reaches `max_retries`.
    fn next_backoff(&mut self) -> Option<Duration> {
        if self.attempt + 1 >= self.policy.max_retries {
            return None;
        }
        self.attempt += 1;
        Some(self.policy.delay_for(self.attempt))
    }
}

/// Backoff for one-time bootstrap calls.
pub fn bootstrap_backoff(base: Duration, max: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: base,
        max_interval: max,
        max_elapsed_time: None,
        ..Default::default()
    }
}

/// Single-shot deadline.
#[derive(Debug, Default)]
pub struct RetryTimer {
    deadline: Option<Instant>,
}

impl RetryTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer `delay` from now, replacing any earlier deadline.
    pub fn schedule(&mut self, delay: Duration) -> Instant {
        let deadline = Instant::now() + delay;
        trace!(delay_ms = delay.as_millis() as u64, "Retry timer armed");
        self.deadline = Some(deadline);
        deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Wait for the armed deadline, then disarm. Returns at once if the timer
    /// is not armed.
    pub async fn expired(&mut self) {
        if let Some(deadline) = self.deadline {
            tokio::time::sleep_until(deadline).await;
            self.deadline = None;
        }
    }
}
