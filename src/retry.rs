use std::time::Duration;
use tracing::warn;

/// Decision returned by the retry policy after a failed analysis attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after `delay` (includes the 1-based retry number).
    Retry { attempt: u32, delay: Duration },
    /// Exhausted all attempts, or the failure is permanent.
    GiveUp,
}

/// Retry policy for analysis jobs.
///
/// A job gets `max_attempts` tries in total. Between tries the worker
/// sleeps for an exponentially growing delay capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
        }
    }

    /// Decide what to do after attempt number `attempts_made` (1-based) failed.
    ///
    /// `retryable` is false for failures that will not go away on their own,
    /// such as a session that no longer exists.
    pub fn evaluate(&self, session_id: &str, attempts_made: u32, retryable: bool) -> RetryDecision {
        if !retryable {
            warn!(session_id, "analysis failed permanently, not retrying");
            return RetryDecision::GiveUp;
        }

        if attempts_made < self.max_attempts {
            let delay = self.backoff_delay(attempts_made.saturating_sub(1));
            warn!(
                session_id,
                attempt = attempts_made,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "analysis failed, retrying"
            );
            RetryDecision::Retry {
                attempt: attempts_made,
                delay,
            }
        } else {
            warn!(
                session_id,
                max_attempts = self.max_attempts,
                "analysis retries exhausted, dropping job"
            );
            RetryDecision::GiveUp
        }
    }

    /// `initial_delay * 2^consecutive_failures`, capped at `max_delay`.
    pub fn backoff_delay(&self, consecutive_failures: u32) -> Duration {
        let initial_ms = self.initial_delay.as_millis() as u64;
        let shift = 1u64.checked_shl(consecutive_failures).unwrap_or(u64::MAX);
        let delay = initial_ms.saturating_mul(shift);
        Duration::from_millis(delay.min(self.max_delay.as_millis() as u64))
    }
}
