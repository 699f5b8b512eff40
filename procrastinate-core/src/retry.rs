//! Retry policies: pure decisions about whether and when a failed job runs
//! again.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use crate::task::TaskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Every wait is `initial_interval`.
    Fixed,
    /// Wait grows as `initial_interval * attempts`.
    Linear,
    /// Wait doubles every attempt, starting from `initial_interval`.
    Exponential,
}

/// Decides, from the attempts count and the error a handler returned,
/// whether a job is retried and when. `max_attempts` is inclusive: a policy
/// with `max_attempts = 3` lets a job execute exactly three times.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    initial_interval: Duration,
    maximum_interval: Option<Duration>,
    jitter: bool,
    /// When set, only failures carrying one of these kinds are retried.
    retry_kinds: Option<Vec<String>>,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(max_attempts: u32, initial_interval: Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(max_attempts, initial_interval)
    }

    /// A policy that never retries: the first failure is final.
    pub fn no_retries() -> Self {
        RetryPolicyBuilder::new(1, Duration::zero()).provide()
    }

    /// `attempts` is the count including the execution that just failed.
    /// Returns the moment to run again, or `None` to give up.
    ///
    /// An explicit retry request from the handler is always honored (with
    /// the handler's own timestamp when it provided one); an abort never is.
    pub fn retry_at(&self, attempts: i32, error: &TaskError) -> Option<DateTime<Utc>> {
        match error {
            TaskError::Aborted => None,
            TaskError::Retry { at } => {
                Some(at.unwrap_or_else(|| Utc::now() + self.interval_for(attempts)))
            }
            TaskError::Failure { kind, .. } => {
                if attempts >= self.max_attempts as i32 {
                    return None;
                }
                if let Some(allowed) = &self.retry_kinds {
                    let retryable = matches!(kind, Some(k) if allowed.iter().any(|a| a == k));
                    if !retryable {
                        return None;
                    }
                }
                Some(Utc::now() + self.interval_for(attempts))
            }
        }
    }

    /// Determine the wait before the next execution, given how many
    /// executions have happened.
    pub fn interval_for(&self, attempts: i32) -> Duration {
        let attempt = attempts.max(1);
        let interval = match self.backoff {
            Backoff::Fixed => self.initial_interval,
            Backoff::Linear => self.initial_interval * attempt,
            Backoff::Exponential => {
                // Cap the exponent: past this the cap below dominates anyway.
                let exponent = (attempt - 1).min(20) as u32;
                self.initial_interval * 2i32.pow(exponent)
            }
        };

        let interval = match self.maximum_interval {
            Some(maximum) => interval.min(maximum),
            None => interval,
        };

        if self.jitter && interval > Duration::zero() {
            let extra_ms = rand::thread_rng().gen_range(0..=interval.num_milliseconds() / 4);
            interval + Duration::milliseconds(extra_ms)
        } else {
            interval
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::no_retries()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    max_attempts: u32,
    backoff: Backoff,
    initial_interval: Duration,
    maximum_interval: Option<Duration>,
    jitter: bool,
    retry_kinds: Option<Vec<String>>,
}

impl RetryPolicyBuilder {
    pub fn new(max_attempts: u32, initial_interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Exponential,
            initial_interval,
            maximum_interval: None,
            jitter: false,
            retry_kinds: None,
        }
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn maximum_interval(mut self, interval: Duration) -> Self {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Restrict retries to failures tagged with one of these kinds.
    pub fn retry_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retry_kinds = Some(kinds.into_iter().map(Into::into).collect());
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            jitter: self.jitter,
            retry_kinds: self.retry_kinds.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn failure() -> TaskError {
        TaskError::failure(anyhow!("boom"))
    }

    #[test]
    fn test_fixed_backoff_is_constant() {
        let policy = RetryPolicy::build(10, Duration::seconds(2))
            .backoff(Backoff::Fixed)
            .provide();

        assert_eq!(policy.interval_for(1), Duration::seconds(2));
        assert_eq!(policy.interval_for(2), Duration::seconds(2));
        assert_eq!(policy.interval_for(7), Duration::seconds(2));
    }

    #[test]
    fn test_linear_backoff_grows_with_attempts() {
        let policy = RetryPolicy::build(10, Duration::seconds(3))
            .backoff(Backoff::Linear)
            .provide();

        assert_eq!(policy.interval_for(1), Duration::seconds(3));
        assert_eq!(policy.interval_for(2), Duration::seconds(6));
        assert_eq!(policy.interval_for(3), Duration::seconds(9));
    }

    #[test]
    fn test_exponential_backoff_doubles() {
        let policy = RetryPolicy::build(10, Duration::seconds(1)).provide();

        assert_eq!(policy.interval_for(1), Duration::seconds(1));
        assert_eq!(policy.interval_for(2), Duration::seconds(2));
        assert_eq!(policy.interval_for(3), Duration::seconds(4));
        assert_eq!(policy.interval_for(4), Duration::seconds(8));
    }

    #[test]
    fn test_interval_never_exceeds_maximum() {
        let policy = RetryPolicy::build(10, Duration::seconds(2))
            .maximum_interval(Duration::seconds(4))
            .provide();

        assert_eq!(policy.interval_for(1), Duration::seconds(2));
        assert_eq!(policy.interval_for(2), Duration::seconds(4));
        assert_eq!(policy.interval_for(5), Duration::seconds(4));
    }

    #[test]
    fn test_max_attempts_is_inclusive() {
        let policy = RetryPolicy::build(3, Duration::seconds(1)).provide();

        assert!(policy.retry_at(1, &failure()).is_some());
        assert!(policy.retry_at(2, &failure()).is_some());
        assert!(policy.retry_at(3, &failure()).is_none());
    }

    #[test]
    fn test_no_retries_policy_declines_first_failure() {
        let policy = RetryPolicy::no_retries();
        assert!(policy.retry_at(1, &failure()).is_none());
    }

    #[test]
    fn test_kind_allow_list() {
        let policy = RetryPolicy::build(5, Duration::seconds(1))
            .retry_kinds(["io"])
            .provide();

        let io_failure = TaskError::failure_with_kind("io", anyhow!("connection reset"));
        let parse_failure = TaskError::failure_with_kind("parse", anyhow!("bad payload"));

        assert!(policy.retry_at(1, &io_failure).is_some());
        assert!(policy.retry_at(1, &parse_failure).is_none());
        // An untagged failure is not on the allow-list either.
        assert!(policy.retry_at(1, &failure()).is_none());
    }

    #[test]
    fn test_abort_is_never_retried() {
        let policy = RetryPolicy::build(10, Duration::seconds(1)).provide();
        assert!(policy.retry_at(1, &TaskError::Aborted).is_none());
    }

    #[test]
    fn test_explicit_retry_is_honored_past_max_attempts() {
        let policy = RetryPolicy::no_retries();
        assert!(policy.retry_at(50, &TaskError::retry()).is_some());
    }

    #[test]
    fn test_explicit_retry_timestamp_wins() {
        let policy = RetryPolicy::build(3, Duration::seconds(60)).provide();
        let at = Utc::now() + Duration::seconds(5);
        assert_eq!(policy.retry_at(1, &TaskError::retry_at(at)), Some(at));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::build(5, Duration::seconds(4))
            .backoff(Backoff::Fixed)
            .jitter()
            .provide();

        for _ in 0..50 {
            let interval = policy.interval_for(1);
            assert!(interval >= Duration::seconds(4));
            assert!(interval <= Duration::seconds(5));
        }
    }
}
