use std::time::Duration;

use crate::config::RetryConfig;

/// Bounded redelivery with increasing backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Vec<Duration>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            config
                .backoff_secs
                .iter()
                .map(|secs| Duration::from_secs(*secs))
                .collect(),
        )
    }

    /// A single attempt, no redelivery.
    pub fn no_retry() -> Self {
        Self::new(1, Vec::new())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before redelivering a task whose attempt `attempt` just failed,
    /// or `None` when that was the last allowed attempt.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let idx = attempt.saturating_sub(1) as usize;
        Some(
            self.backoff
                .get(idx)
                .or_else(|| self.backoff.last())
                .copied()
                .unwrap_or(Duration::ZERO),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(60)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_secs(300)));
        assert_eq!(policy.delay_for(3), None);
    }

    #[test]
    fn test_last_backoff_repeats() {
        let policy = RetryPolicy::new(5, vec![Duration::from_millis(10)]);
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(10)));
        assert_eq!(policy.delay_for(4), Some(Duration::from_millis(10)));
        assert_eq!(policy.delay_for(5), None);
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.delay_for(1), None);
        assert_eq!(RetryPolicy::new(0, vec![]).max_attempts(), 1);
    }

    #[test]
    fn test_missing_backoff_is_immediate() {
        let policy = RetryPolicy::new(2, vec![]);
        assert_eq!(policy.delay_for(1), Some(Duration::ZERO));
    }
}
