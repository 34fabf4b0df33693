/// Maximum number of retry publishes before a failure becomes terminal.
///
/// `2` retries = `3` total execution attempts. Single source of truth for the
/// limit; the delay between attempts lives in the broker topology
/// (`x-message-ttl` on the retry queue, see `messaging::topology`).
pub const MAX_RETRIES: i32 = 2;

// ── Decision ───────────────────────────────────────────────────────────────────

/// Outcome of evaluating the policy for a job that has just failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Publish the job to the retry exchange; the broker holds it in the
    /// delay ring and re-delivers it to the input queue after the TTL.
    Retry {
        /// `retry_count` the next delivery of this job will carry.
        next_attempt: i32,
    },

    /// Budget exhausted — publish a terminal error result instead.
    GiveUp,
}

// ── Policy ─────────────────────────────────────────────────────────────────────

/// Retry policy for transcription jobs. `Copy`, so dispatch routines pass it
/// around freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum retry publishes (not total attempts): `2` allows 3 executions.
    pub max_retries: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: i32) -> Self {
        Self { max_retries }
    }

    /// Decide what to do with a job that has just failed.
    ///
    /// `retry_count` is the number of attempts already made (0 = first
    /// attempt, never retried).
    pub fn decide(&self, retry_count: i32) -> RetryDecision {
        if retry_count < self.max_retries {
            RetryDecision::Retry {
                next_attempt: retry_count + 1,
            }
        } else {
            RetryDecision::GiveUp
        }
    }

    /// `true` while `retry_count < max_retries`.
    #[inline]
    pub fn should_retry(&self, retry_count: i32) -> bool {
        retry_count < self.max_retries
    }

    /// Attempts remaining at the given `retry_count`, saturating at 0.
    #[inline]
    pub fn attempts_remaining(&self, retry_count: i32) -> i32 {
        (self.max_retries - retry_count).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_allows_three_total_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn decide_increments_monotonically() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(0), RetryDecision::Retry { next_attempt: 1 });
        assert_eq!(policy.decide(1), RetryDecision::Retry { next_attempt: 2 });
        assert_eq!(policy.decide(2), RetryDecision::GiveUp);
    }

    #[test]
    fn attempts_remaining_saturates_at_zero() {
        let policy = RetryPolicy::new(2);
        assert_eq!(policy.attempts_remaining(0), 2);
        assert_eq!(policy.attempts_remaining(2), 0);
        assert_eq!(policy.attempts_remaining(5), 0);
    }

    #[test]
    fn header_inflated_count_goes_straight_to_give_up() {
        // A delivery whose header carried retry_count=2 must not be retried
        // again even if its body said 0.
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(2), RetryDecision::GiveUp);
    }
}
