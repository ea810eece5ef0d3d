//! Retry policy with cancellable back-off waits

use super::error::ResilienceError;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How many times an operation is re-run and how long to wait in between.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt (0 = single attempt)
    pub max_retries: u32,
    /// Delay before the first retry
    pub delay: Duration,
    /// Multiplier applied to the delay after every retry (1.0 = constant)
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_millis(200),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Constant delay between a fixed number of retries
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            backoff_multiplier: 1.0,
            max_delay: delay,
        }
    }

    /// Total number of attempts this policy allows
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let scaled = self.delay.as_secs_f64() * self.backoff_multiplier.max(1.0).powi(exponent);
        if !scaled.is_finite() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled).min(self.max_delay)
    }

    /// Sleep before the next attempt, returning early with `Cancelled`.
    pub async fn wait(&self, attempt: u32, cancel: &CancellationToken) -> Result<(), ResilienceError> {
        let delay = self.delay_for(attempt);
        if delay.is_zero() {
            return if cancel.is_cancelled() {
                Err(ResilienceError::Cancelled)
            } else {
                Ok(())
            };
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ResilienceError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delays_are_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(500),
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.max_attempts(), 6);
    }

    #[test]
    fn test_fixed_policy() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(50));
        assert_eq!(policy.delay_for(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for(7), Duration::from_millis(50));
        assert_eq!(RetryPolicy::none().max_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_cancellable() {
        let policy = RetryPolicy::fixed(1, Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });

        let result = policy.wait(1, &cancel).await;
        assert_eq!(result, Err(ResilienceError::Cancelled));
    }
}
