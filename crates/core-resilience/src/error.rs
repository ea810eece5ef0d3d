//! Error type shared by every resilience primitive

use std::time::Duration;
use thiserror::Error;

/// Failure produced by a pool, breaker, retry loop or rate limiter.
///
/// The variants carry enough classification for the retry loop and the
/// circuit breaker to decide what to do next without inspecting messages.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResilienceError {
    /// A failure that is expected to go away on its own (refused
    /// connection, broken pipe, broker busy).
    #[error("transient failure: {0}")]
    Transient(String),

    /// A failure that will not improve by retrying (bad credentials,
    /// unknown exchange, payload rejected).
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The circuit breaker is open and rejected the call without running it.
    #[error("circuit breaker is open for {0}")]
    CircuitOpen(String),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation did not finish in time.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// No pool slot became available before the acquire timeout.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// The pool has been shut down.
    #[error("connection pool is closed")]
    PoolClosed,

    /// A non-waiting rate limiter check failed.
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// Every attempt of a retried operation failed.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<ResilienceError>,
    },
}

impl ResilienceError {
    /// Convenience constructor for transient failures.
    pub fn transient(message: impl Into<String>) -> Self {
        ResilienceError::Transient(message.into())
    }

    /// Convenience constructor for permanent failures.
    pub fn permanent(message: impl Into<String>) -> Self {
        ResilienceError::Permanent(message.into())
    }

    /// Whether the failure is likely temporary.
    pub fn is_transient(&self) -> bool {
        match self {
            ResilienceError::Transient(_) | ResilienceError::Timeout(_) => true,
            ResilienceError::RetriesExhausted { last, .. } => last.is_transient(),
            _ => false,
        }
    }

    /// Whether the failure is known to be permanent.
    pub fn is_permanent(&self) -> bool {
        match self {
            ResilienceError::Permanent(_) => true,
            ResilienceError::RetriesExhausted { last, .. } => last.is_permanent(),
            _ => false,
        }
    }

    /// Whether a retry loop may run the operation again after this failure.
    ///
    /// Cancellation and an open circuit are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ResilienceError::Transient(_) | ResilienceError::Timeout(_)
        )
    }

    /// Whether this failure counts against the circuit breaker.
    pub fn should_trip_breaker(&self) -> bool {
        matches!(
            self,
            ResilienceError::Transient(_)
                | ResilienceError::Permanent(_)
                | ResilienceError::Timeout(_)
        )
    }

    /// Whether the failure is a caller-initiated cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ResilienceError::Cancelled)
    }

    /// Whether the failure came from an open circuit breaker.
    pub fn is_circuit_open(&self) -> bool {
        match self {
            ResilienceError::CircuitOpen(_) => true,
            ResilienceError::RetriesExhausted { last, .. } => last.is_circuit_open(),
            _ => false,
        }
    }

    /// The innermost cause, unwrapping `RetriesExhausted`.
    pub fn root_cause(&self) -> &ResilienceError {
        match self {
            ResilienceError::RetriesExhausted { last, .. } => last.root_cause(),
            other => other,
        }
    }
}
