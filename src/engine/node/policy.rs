// SPDX-License-Identifier: MIT

//! Retry policy applied by the node executor

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use super::ErrorKind;
use crate::engine::error::RetryPolicyError;

/// Upper bound on a single backoff delay
const MAX_DELAY_SECONDS: f64 = 300.0;

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// `backoff_seconds * attempt`
    Linear,
    /// `backoff_seconds * 2^(attempt - 1)`
    Exponential,
}

/// Per-node retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts including the first; values below 1 behave as 1
    pub max_attempts: u32,
    /// Base delay between attempts
    pub backoff_seconds: f64,
    pub backoff: BackoffStrategy,
    /// Failures of these kinds are retried; everything else fails at once
    pub retryable_error_kinds: HashSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_seconds: 1.0,
            backoff: BackoffStrategy::Fixed,
            retryable_error_kinds: [
                ErrorKind::Timeout,
                ErrorKind::UpstreamUnavailable,
                ErrorKind::RateLimited,
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl RetryPolicy {
    /// A policy that runs the node exactly once
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff_seconds: 0.0,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff_seconds: f64, backoff: BackoffStrategy) -> Self {
        self.backoff_seconds = backoff_seconds;
        self.backoff = backoff;
        self
    }

    pub fn with_retryable(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_error_kinds = kinds.into_iter().collect();
        self
    }

    /// Effective number of attempts
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable_error_kinds.contains(&kind)
    }

    /// Delay to wait after the failed attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = if self.backoff_seconds.is_finite() {
            self.backoff_seconds.max(0.0)
        } else {
            0.0
        };
        let secs = match self.backoff {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base * f64::from(attempt.max(1)),
            BackoffStrategy::Exponential => {
                let shift = attempt.saturating_sub(1).min(20);
                base * f64::from(1u32 << shift)
            }
        };
        Duration::from_secs_f64(secs.min(MAX_DELAY_SECONDS))
    }

    /// Reject values that only make sense as typos
    pub fn validate(&self) -> Result<(), RetryPolicyError> {
        if self.max_attempts == 0 {
            return Err(RetryPolicyError::ZeroAttempts);
        }
        if !self.backoff_seconds.is_finite() || self.backoff_seconds < 0.0 {
            return Err(RetryPolicyError::InvalidBackoff(self.backoff_seconds));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts(), 3);
        assert_eq!(policy.backoff, BackoffStrategy::Fixed);
        assert!(policy.is_retryable(ErrorKind::Timeout));
        assert!(policy.is_retryable(ErrorKind::RateLimited));
        assert!(!policy.is_retryable(ErrorKind::InvalidRequest));
    }

    #[test]
    fn test_zero_attempts_means_one() {
        let policy = RetryPolicy::default().with_max_attempts(0);
        assert_eq!(policy.attempts(), 1);
        assert_eq!(policy.validate(), Err(RetryPolicyError::ZeroAttempts));
    }

    #[test]
    fn test_delays() {
        let fixed = RetryPolicy::default().with_backoff(2.0, BackoffStrategy::Fixed);
        assert_eq!(fixed.delay_for(1), Duration::from_secs(2));
        assert_eq!(fixed.delay_for(3), Duration::from_secs(2));

        let linear = RetryPolicy::default().with_backoff(2.0, BackoffStrategy::Linear);
        assert_eq!(linear.delay_for(3), Duration::from_secs(6));

        let exponential = RetryPolicy::default().with_backoff(1.0, BackoffStrategy::Exponential);
        assert_eq!(exponential.delay_for(1), Duration::from_secs(1));
        assert_eq!(exponential.delay_for(4), Duration::from_secs(8));
        assert_eq!(exponential.delay_for(40), Duration::from_secs(300));
    }

    #[test]
    fn test_bad_backoff_clamps_to_zero() {
        let policy = RetryPolicy::default().with_backoff(-1.0, BackoffStrategy::Fixed);
        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert_eq!(policy.validate(), Err(RetryPolicyError::InvalidBackoff(-1.0)));

        let policy = RetryPolicy::default().with_backoff(f64::NAN, BackoffStrategy::Linear);
        assert_eq!(policy.delay_for(2), Duration::ZERO);
    }

    #[test]
    fn test_deserialize_partial_policy() {
        let policy: RetryPolicy = serde_yaml::from_str(
            "max_attempts: 5\nbackoff: exponential\nretryable_error_kinds: [timeout]\n",
        )
        .unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff_seconds, 1.0);
        assert_eq!(policy.backoff, BackoffStrategy::Exponential);
        assert!(!policy.is_retryable(ErrorKind::RateLimited));
    }

    #[test]
    fn test_unknown_policy_keys_are_rejected() {
        let err = serde_yaml::from_str::<RetryPolicy>("max_attemps: 1\n").unwrap_err();
        assert!(err.to_string().contains("max_attemps"));
    }
}
