//! Step Retry Policy
//!
//! Steps that talk to flaky remote services can declare a retry policy:
//!
//! ```yaml
//! retry:
//!   max_retries: 3
//!   strategy: exponential
//!   interval_ms: 10000
//!   basis: 2.0
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the wait between attempts grows.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    /// Same interval every time
    #[default]
    Constant,
    /// interval * (n + 1)
    Linear,
    /// interval * basis^n
    Exponential,
}

/// Retry configuration for a step. The default never retries.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_retries: u32,

    #[serde(default)]
    pub strategy: RetryStrategy,

    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_basis")]
    pub basis: f32,
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_basis() -> f32 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            strategy: RetryStrategy::Constant,
            interval_ms: default_interval_ms(),
            basis: default_basis(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, strategy: RetryStrategy, interval_ms: u64) -> Self {
        Self {
            max_retries,
            strategy,
            interval_ms,
            ..Self::default()
        }
    }

    /// True when the policy never retries.
    pub fn is_disabled(&self) -> bool {
        self.max_retries == 0
    }

    /// Delay before the next attempt, given how many retries already happened.
    ///
    /// Returns `None` once the retry budget is spent.
    pub fn delay_for(&self, retried: u32) -> Option<Duration> {
        if retried >= self.max_retries {
            return None;
        }
        let millis = match self.strategy {
            RetryStrategy::Constant => self.interval_ms,
            RetryStrategy::Linear => self.interval_ms.saturating_mul(u64::from(retried) + 1),
            RetryStrategy::Exponential => {
                (self.interval_ms as f64 * f64::from(self.basis).powi(retried as i32)).round()
                    as u64
            }
        };
        Some(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_never_retries() {
        let policy = RetryPolicy::default();
        assert!(policy.is_disabled());
        assert_eq!(policy.delay_for(0), None);
    }

    #[test]
    fn test_constant_delay() {
        let policy = RetryPolicy::new(2, RetryStrategy::Constant, 500);
        assert_eq!(policy.delay_for(0), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay_for(2), None);
    }

    #[test]
    fn test_linear_delay() {
        let policy = RetryPolicy::new(3, RetryStrategy::Linear, 100);
        assert_eq!(policy.delay_for(0), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(300)));
    }

    #[test]
    fn test_exponential_delay() {
        let mut policy = RetryPolicy::new(4, RetryStrategy::Exponential, 100);
        policy.basis = 3.0;
        assert_eq!(policy.delay_for(0), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(900)));
    }

    #[test]
    fn test_yaml_defaults() {
        let policy: RetryPolicy = serde_yaml::from_str("max_retries: 2").unwrap();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.strategy, RetryStrategy::Constant);
        assert_eq!(policy.interval_ms, 1000);

        let policy: RetryPolicy =
            serde_yaml::from_str("max_retries: 1\nstrategy: exponential").unwrap();
        assert_eq!(policy.strategy, RetryStrategy::Exponential);
    }
}
