// ============================================================================
// Retry & Dead-letter Policy
// ============================================================================
//
// Retry state travels as message metadata, modeled here as an explicit
// envelope around the queued payload. The policy functions are pure so the
// backoff schedule and the dead-letter cutoff are unit-testable without a
// broker.
//
// ============================================================================

use std::time::Duration;

use crate::config::RetryConfig;

/// Queue-level retry policy: bounded attempts with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before republishing attempt `attempt` (1-based):
    /// `base_delay * 2^(attempt-1)`.
    ///
    /// With the defaults (3 retries, 1000 ms base) the schedule for
    /// attempts 1..3 is exactly 1000, 2000, 4000 ms.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.base_delay.as_millis() as u64 * factor)
    }

    /// Terminal cutoff: once the incremented attempt count exceeds
    /// `max_retries`, the job is dead-lettered instead of requeued.
    pub fn should_dead_letter(&self, attempt: u32) -> bool {
        attempt > self.max_retries
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(cfg: RetryConfig) -> Self {
        Self::new(cfg.max_retries, Duration::from_millis(cfg.base_delay_ms))
    }
}

/// Attempt metadata attached to a job as it traverses the queue.
///
/// The envelope wraps the payload conceptually - on the wire the attempt
/// count is a separate stream-entry field, never part of the serialized job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryEnvelope {
    /// Number of failed processing attempts so far (0 for a fresh job)
    pub attempt: u32,
}

impl RetryEnvelope {
    pub fn fresh() -> Self {
        Self { attempt: 0 }
    }

    pub fn with_attempt(attempt: u32) -> Self {
        Self { attempt }
    }

    /// The envelope a failed delivery is republished under.
    pub fn next(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
        }
    }

    /// Decide what happens to this delivery after a handler failure.
    pub fn after_failure(&self, policy: &RetryPolicy) -> RetryDecision {
        let next = self.next();
        if policy.should_dead_letter(next.attempt) {
            RetryDecision::DeadLetter { attempt: next.attempt }
        } else {
            RetryDecision::Requeue {
                attempt: next.attempt,
                delay: policy.next_delay(next.attempt),
            }
        }
    }
}

/// Outcome of applying the retry policy to a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Republish with the incremented attempt count after `delay`,
    /// then acknowledge the original delivery.
    Requeue { attempt: u32, delay: Duration },
    /// Route to the dead-letter queue - terminal.
    DeadLetter { attempt: u32 },
}
