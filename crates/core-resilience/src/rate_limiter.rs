//! Rate limiting for preventing broker overload
//!
//! Token bucket rate limiting backed by the governor crate.

use super::error::ResilienceError;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota,
};
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiter using a token bucket
///
/// Cloning shares the bucket.
///
/// # Example
/// ```no_run
/// use courier_core_resilience::{RateLimiter, ResilienceError};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), ResilienceError> {
/// // Allow 100 messages per second
/// let limiter = RateLimiter::per_second(100)?;
/// let cancel = CancellationToken::new();
///
/// limiter.until_ready(&cancel).await?;
/// // publish...
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RateLimiter {
    limiter: Arc<DirectLimiter>,
    max_requests: u32,
    period: Duration,
}

impl RateLimiter {
    /// Allow `max_requests` per `period`, with a burst of `max_requests`.
    pub fn new(max_requests: u32, period: Duration) -> Result<Self, ResilienceError> {
        let burst = NonZeroU32::new(max_requests)
            .ok_or_else(|| ResilienceError::permanent("max_requests must be > 0"))?;

        let quota = Quota::with_period(period / max_requests)
            .ok_or_else(|| ResilienceError::permanent("rate limit period must be > 0"))?
            .allow_burst(burst);

        Ok(Self {
            limiter: Arc::new(governor::RateLimiter::direct(quota)),
            max_requests,
            period,
        })
    }

    /// Create a rate limiter with requests per second
    pub fn per_second(requests_per_second: u32) -> Result<Self, ResilienceError> {
        Self::new(requests_per_second, Duration::from_secs(1))
    }

    /// Wait until a token is available, or until `cancel` fires.
    pub async fn until_ready(&self, cancel: &CancellationToken) -> Result<(), ResilienceError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ResilienceError::Cancelled),
            _ = self.limiter.until_ready() => Ok(()),
        }
    }

    /// Take a token without waiting
    pub fn try_acquire(&self) -> Result<(), ResilienceError> {
        self.limiter
            .check()
            .map_err(|_| ResilienceError::RateLimitExceeded)
    }

    /// Execute an operation once a token is available
    pub async fn execute<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ResilienceError>>,
    {
        self.until_ready(cancel).await?;
        op().await
    }

    /// Get the maximum requests per period
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Get the rate limit period
    pub fn period(&self) -> Duration {
        self.period
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_requests", &self.max_requests)
            .field("period", &self.period)
            .finish()
    }
}
