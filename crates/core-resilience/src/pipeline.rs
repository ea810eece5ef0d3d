//! Resilience pipeline: retry loop wrapped around a circuit breaker
//!
//! One pipeline instance guards one kind of operation for one backend.
//! Connect and publish pipelines never share breaker state, so a backend
//! that is slow to accept connections does not trip the publish breaker.

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use super::error::ResilienceError;
use super::retry::RetryPolicy;
use std::fmt;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The operation a pipeline guards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Opening a connection, channel, socket or producer
    Connect,
    /// Transmitting a message on a leased resource
    Publish,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Connect => "connect",
            OperationKind::Publish => "publish",
        }
    }

    /// Whether cancellation aborts an attempt that is already running.
    ///
    /// A connect attempt that has started is allowed to finish; only further
    /// retries are prevented.
    pub fn aborts_in_flight(&self) -> bool {
        matches!(self, OperationKind::Publish)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry and breaker settings for one pipeline
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,
}

/// Retry + circuit breaker around one operation kind
///
/// Cloning shares breaker state.
///
/// # Example
/// ```no_run
/// use courier_core_resilience::{OperationKind, PipelineConfig, ResilienceError, ResiliencePipeline};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), ResilienceError> {
/// let pipeline = ResiliencePipeline::new("mqtt", OperationKind::Connect, PipelineConfig::default());
/// let cancel = CancellationToken::new();
/// let session = pipeline.execute(&cancel, || async { Ok::<_, ResilienceError>("session") }).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ResiliencePipeline {
    kind: OperationKind,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl ResiliencePipeline {
    pub fn new(backend: &str, kind: OperationKind, config: PipelineConfig) -> Self {
        Self {
            kind,
            retry: config.retry,
            breaker: CircuitBreaker::new(format!("{}.{}", backend, kind), config.breaker),
        }
    }

    /// Pipeline name, `<backend>.<kind>`
    pub fn name(&self) -> &str {
        self.breaker.name()
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run `op` under the retry policy and the circuit breaker.
    ///
    /// Every attempt asks the breaker for a permit first; an open circuit
    /// fails the whole call immediately without running `op`. Failed attempts
    /// are recorded once each; cancellation is never recorded as a failure.
    pub async fn execute<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ResilienceError::Cancelled);
            }
            attempt += 1;

            let permit = self.breaker.try_acquire()?;
            let result = if self.kind.aborts_in_flight() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ResilienceError::Cancelled),
                    result = op() => result,
                }
            } else {
                op().await
            };
            permit.settle(&result);

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    debug!(
                        pipeline = %self.name(),
                        attempt,
                        max_attempts,
                        error = %e,
                        "attempt failed, retrying"
                    );
                    self.retry.wait(attempt, cancel).await?;
                }
                Err(e) if attempt > 1 && e.is_retryable() => {
                    return Err(ResilienceError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// The two independent pipelines every backend owns
#[derive(Debug, Clone)]
pub struct BackendPipelines {
    pub connect: ResiliencePipeline,
    pub publish: ResiliencePipeline,
}

impl BackendPipelines {
    pub fn new(backend: &str, connect: PipelineConfig, publish: PipelineConfig) -> Self {
        Self {
            connect: ResiliencePipeline::new(backend, OperationKind::Connect, connect),
            publish: ResiliencePipeline::new(backend, OperationKind::Publish, publish),
        }
    }

    /// Same settings for both kinds, still two separate breakers
    pub fn uniform(backend: &str, config: PipelineConfig) -> Self {
        Self::new(backend, config.clone(), config)
    }
}
