//! Circuit Breaker implementation for fault tolerance
//!
//! The circuit breaker prevents cascading failures by failing fast when a service
//! is experiencing issues. It has three states:
//! - Closed: Normal operation, requests pass through
//! - Open: Service is unhealthy, requests fail immediately
//! - HalfOpen: Cool-down elapsed, exactly one probe request is let through
//!
//! The breaker never runs anything itself when used through [`CircuitBreaker::try_acquire`];
//! callers obtain a [`CallPermit`], run their operation and settle the permit with
//! the outcome. A permit that is dropped unsettled counts as cancelled.

use super::error::ResilienceError;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately until `until`
    Open { until: Instant },
    /// Circuit is half-open, a single probe decides what happens next
    HalfOpen,
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Duration to wait before transitioning from open to half-open
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Internal state of the circuit breaker
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    probe_in_flight: bool,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            probe_in_flight: false,
        }
    }
}

#[derive(Debug)]
struct Shared {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Circuit breaker for protecting against cascading failures
///
/// Cloning shares the underlying state, so every clone observes and mutates
/// the same failure counter.
///
/// # Example
/// ```no_run
/// use courier_core_resilience::{CircuitBreaker, CircuitBreakerConfig, ResilienceError};
///
/// #[tokio::main]
/// async fn main() -> Result<(), ResilienceError> {
///     let breaker = CircuitBreaker::new("amqp.publish", CircuitBreakerConfig::default());
///
///     let result = breaker.call(|| async {
///         Ok::<_, ResilienceError>(42)
///     }).await?;
///
///     println!("Result: {}", result);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                config,
                state: Mutex::new(BreakerState::new()),
            }),
        }
    }

    /// Create a new circuit breaker with default configuration
    pub fn new_default(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Name used in errors and logs, e.g. `amqp.connect`
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        self.shared.lock().state
    }

    /// Get current consecutive failure count
    pub fn failure_count(&self) -> u32 {
        self.shared.lock().consecutive_failures
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let mut state = self.shared.lock();
        *state = BreakerState::new();
    }

    /// Ask permission to run one attempt.
    ///
    /// Fails with [`ResilienceError::CircuitOpen`] while the circuit is open or
    /// while another caller holds the half-open probe.
    pub fn try_acquire(&self) -> Result<CallPermit, ResilienceError> {
        let mut state = self.shared.lock();

        match state.state {
            CircuitState::Closed => Ok(self.permit(false)),
            CircuitState::Open { until } => {
                if Instant::now() >= until {
                    debug!(breaker = %self.shared.name, "circuit half-open, admitting probe");
                    state.state = CircuitState::HalfOpen;
                    state.probe_in_flight = true;
                    Ok(self.permit(true))
                } else {
                    Err(ResilienceError::CircuitOpen(self.shared.name.clone()))
                }
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    Err(ResilienceError::CircuitOpen(self.shared.name.clone()))
                } else {
                    state.probe_in_flight = true;
                    Ok(self.permit(true))
                }
            }
        }
    }

    /// Execute a single attempt with circuit breaker protection (no retries)
    pub async fn call<F, Fut, T>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ResilienceError>>,
    {
        let permit = self.try_acquire()?;
        let result = op().await;
        permit.settle(&result);
        result
    }

    fn permit(&self, probe: bool) -> CallPermit {
        CallPermit {
            shared: Arc::clone(&self.shared),
            probe,
            settled: false,
        }
    }
}

/// Permission to run one attempt through a [`CircuitBreaker`].
///
/// Exactly one of `success`, `failure` or `cancelled` records the outcome.
/// Dropping the permit without settling it is treated as `cancelled`.
#[derive(Debug)]
#[must_use = "a permit must be settled with the outcome of the attempt"]
pub struct CallPermit {
    shared: Arc<Shared>,
    probe: bool,
    settled: bool,
}

impl CallPermit {
    /// Whether this permit is the half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Record the outcome of an attempt from its result.
    pub fn settle<T>(self, result: &Result<T, ResilienceError>) {
        match result {
            Ok(_) => self.success(),
            Err(e) if e.should_trip_breaker() => self.failure(),
            Err(_) => self.cancelled(),
        }
    }

    /// The attempt succeeded.
    pub fn success(mut self) {
        self.settled = true;
        let mut state = self.shared.lock();
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::HalfOpen if self.probe => {
                debug!(breaker = %self.shared.name, "probe succeeded, circuit closed");
                state.state = CircuitState::Closed;
                state.consecutive_failures = 0;
                state.probe_in_flight = false;
            }
            // A call admitted before the circuit opened finished late.
            CircuitState::HalfOpen | CircuitState::Open { .. } => {}
        }
    }

    /// The attempt failed in a way that counts against the breaker.
    pub fn failure(mut self) {
        self.settled = true;
        let mut state = self.shared.lock();
        let cooldown = self.shared.config.cooldown;
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.shared.config.failure_threshold {
                    warn!(
                        breaker = %self.shared.name,
                        failures = state.consecutive_failures,
                        cooldown_ms = cooldown.as_millis() as u64,
                        "circuit opened"
                    );
                    state.state = CircuitState::Open {
                        until: Instant::now() + cooldown,
                    };
                    state.consecutive_failures = 0;
                }
            }
            CircuitState::HalfOpen if self.probe => {
                warn!(breaker = %self.shared.name, "probe failed, circuit re-opened");
                state.state = CircuitState::Open {
                    until: Instant::now() + cooldown,
                };
                state.probe_in_flight = false;
            }
            CircuitState::HalfOpen | CircuitState::Open { .. } => {}
        }
    }

    /// The attempt was cancelled or failed in a way that does not count.
    pub fn cancelled(mut self) {
        self.settled = true;
        self.release_probe();
    }

    fn release_probe(&self) {
        if self.probe {
            let mut state = self.shared.lock();
            if state.state == CircuitState::HalfOpen {
                state.probe_in_flight = false;
            }
        }
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.release_probe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_millis(cooldown_ms),
            },
        )
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), ResilienceError> {
        breaker
            .call(|| async { Err(ResilienceError::transient("test error")) })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_closed_to_open() {
        let breaker = breaker(3, 100);

        for _ in 0..3 {
            assert!(fail(&breaker).await.is_err());
        }

        match breaker.state() {
            CircuitState::Open { .. } => (),
            state => panic!("Expected Open state, got {:?}", state),
        }

        let result = breaker.call(|| async { Ok::<_, ResilienceError>(()) }).await;
        assert!(matches!(result, Err(ResilienceError::CircuitOpen(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_does_not_run_operation() {
        let breaker = breaker(1, 1_000);
        let _ = fail(&breaker).await;

        let mut ran = false;
        let result = breaker
            .call(|| {
                ran = true;
                async { Ok::<_, ResilienceError>(()) }
            })
            .await;
        assert!(result.is_err());
        assert!(!ran);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_probe() {
        let breaker = breaker(2, 50);
        for _ in 0..2 {
            let _ = fail(&breaker).await;
        }

        tokio::time::advance(Duration::from_millis(60)).await;

        let probe = breaker.try_acquire().expect("probe should be admitted");
        assert!(probe.is_probe());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Concurrent callers still fail fast while the probe is running
        assert!(matches!(
            breaker.try_acquire(),
            Err(ResilienceError::CircuitOpen(_))
        ));

        probe.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let breaker = breaker(1, 50);
        let _ = fail(&breaker).await;

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(fail(&breaker).await.is_err());

        match breaker.state() {
            CircuitState::Open { until } => assert!(until > Instant::now()),
            state => panic!("Expected Open state, got {:?}", state),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_probe_frees_slot() {
        let breaker = breaker(1, 50);
        let _ = fail(&breaker).await;
        tokio::time::advance(Duration::from_millis(60)).await;

        let probe = breaker.try_acquire().unwrap();
        drop(probe);

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let again = breaker.try_acquire().unwrap();
        assert!(again.is_probe());
        again.cancelled();
    }

    #[tokio::test]
    async fn test_cancellation_is_not_counted() {
        let breaker = breaker(2, 50);
        let result: Result<(), ResilienceError> = breaker
            .call(|| async { Err(ResilienceError::Cancelled) })
            .await;
        assert!(result.is_err());
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = breaker(3, 50);
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.failure_count(), 2);

        breaker
            .call(|| async { Ok::<_, ResilienceError>(()) })
            .await
            .unwrap();
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_reset() {
        let breaker = breaker(1, 60_000);
        let _ = fail(&breaker).await;

        breaker.reset();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }
}
