//! Retry decisions and backoff for failed stage dispatches.

use std::time::Duration;

use swdl_types::workflow::RetryPolicy;

use super::duration::parse_duration;

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Stateless retry logic. The caller tracks the attempt count and passes the
/// (already resolved) policy in.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether an error label is eligible for retry at all.
    ///
    /// `non_retryable` entries are matched exactly against the label.
    pub fn is_retryable(non_retryable: &[String], label: &str) -> bool {
        !non_retryable.iter().any(|entry| entry == label)
    }

    /// Whether another attempt should follow failed attempt number `attempt`
    /// (1-based).
    pub fn should_retry(
        policy: &RetryPolicy,
        non_retryable: &[String],
        attempt: u32,
        label: &str,
    ) -> bool {
        attempt < policy.max_attempts && Self::is_retryable(non_retryable, label)
    }

    /// Sleep before the retry that follows failed attempt `attempt`:
    /// `min(initial * multiplier^(attempt - 1), max_interval)`.
    ///
    /// Unparsable intervals count as zero.
    pub fn backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
        let initial = parse_duration(&policy.initial_interval).unwrap_or_default();
        let max = parse_duration(&policy.max_interval).unwrap_or_default();
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = policy.backoff_multiplier.max(0.0).powi(exponent);

        let secs = initial.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= max.as_secs_f64() {
            return max;
        }
        Duration::from_secs_f64(secs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
