/*!
 * Error types for courier
 *
 * Every failure crossing the publish or acquire boundary is a
 * [`BrokerError`]; nothing panics or escapes as an untyped error.
 */

use courier_core_resilience::{OperationKind, ResilienceError};
use thiserror::Error;

use crate::transport::{BackendKind, TransportError};

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Coarse classification of a [`BrokerError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No connection could be obtained
    Connect,
    /// A breaker rejected the call without running it
    CircuitOpen,
    /// Serialization or send failed on an obtained connection
    Transmission,
    /// The caller cancelled
    Cancelled,
    Config,
    Unsupported,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The pool could not produce a usable connection
    #[error("{backend}: could not obtain a connection: {cause}")]
    Connect {
        backend: BackendKind,
        #[source]
        cause: ResilienceError,
    },

    /// The breaker guarding `operation` is open
    #[error("{backend}: {operation} circuit is open")]
    CircuitOpen {
        backend: BackendKind,
        operation: OperationKind,
    },

    #[error("{backend}: transmission failed: {message}")]
    Transmission {
        backend: BackendKind,
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("{backend}: operation cancelled")]
    Cancelled { backend: BackendKind },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{backend}: {operation} is not supported")]
    Unsupported {
        backend: BackendKind,
        operation: String,
    },
}

impl BrokerError {
    /// Map a pool acquisition failure
    pub fn from_acquire(backend: BackendKind, err: ResilienceError) -> Self {
        if err.is_cancelled() {
            BrokerError::Cancelled { backend }
        } else if err.is_circuit_open() {
            BrokerError::CircuitOpen {
                backend,
                operation: OperationKind::Connect,
            }
        } else {
            BrokerError::Connect {
                backend,
                cause: err,
            }
        }
    }

    /// Map a failure of the publish pipeline
    pub fn from_publish(backend: BackendKind, err: ResilienceError) -> Self {
        if err.is_cancelled() {
            BrokerError::Cancelled { backend }
        } else if err.is_circuit_open() {
            BrokerError::CircuitOpen {
                backend,
                operation: OperationKind::Publish,
            }
        } else {
            BrokerError::Transmission {
                backend,
                message: err.to_string(),
                source: Some(Box::new(err)),
            }
        }
    }

    pub fn serialization(backend: BackendKind, err: serde_json::Error) -> Self {
        BrokerError::Transmission {
            backend,
            message: format!("serialization failed: {}", err),
            source: Some(Box::new(err)),
        }
    }

    pub fn transport(backend: BackendKind, err: TransportError) -> Self {
        BrokerError::Transmission {
            backend,
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            BrokerError::Connect { .. } => FailureKind::Connect,
            BrokerError::CircuitOpen { .. } => FailureKind::CircuitOpen,
            BrokerError::Transmission { .. } => FailureKind::Transmission,
            BrokerError::Cancelled { .. } => FailureKind::Cancelled,
            BrokerError::Config(_) => FailureKind::Config,
            BrokerError::Unsupported { .. } => FailureKind::Unsupported,
        }
    }

    /// The backend that produced the error, if any
    pub fn backend(&self) -> Option<BackendKind> {
        match self {
            BrokerError::Connect { backend, .. }
            | BrokerError::CircuitOpen { backend, .. }
            | BrokerError::Transmission { backend, .. }
            | BrokerError::Cancelled { backend }
            | BrokerError::Unsupported { backend, .. } => Some(*backend),
            BrokerError::Config(_) => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BrokerError::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_mapping() {
        let cancelled = BrokerError::from_acquire(BackendKind::Amqp, ResilienceError::Cancelled);
        assert_eq!(cancelled.kind(), FailureKind::Cancelled);

        let open = BrokerError::from_acquire(
            BackendKind::Amqp,
            ResilienceError::CircuitOpen("amqp.connect".into()),
        );
        assert!(matches!(
            open,
            BrokerError::CircuitOpen {
                operation: OperationKind::Connect,
                ..
            }
        ));

        let exhausted = BrokerError::from_acquire(
            BackendKind::Log,
            ResilienceError::RetriesExhausted {
                attempts: 3,
                last: Box::new(ResilienceError::transient("refused")),
            },
        );
        assert_eq!(exhausted.kind(), FailureKind::Connect);
        assert_eq!(exhausted.backend(), Some(BackendKind::Log));
    }

    #[test]
    fn test_publish_mapping() {
        let open = BrokerError::from_publish(
            BackendKind::Mqtt,
            ResilienceError::CircuitOpen("mqtt.publish".into()),
        );
        assert!(matches!(
            open,
            BrokerError::CircuitOpen {
                operation: OperationKind::Publish,
                ..
            }
        ));

        let failed = BrokerError::from_publish(BackendKind::Mqtt, ResilienceError::transient("reset"));
        assert_eq!(failed.kind(), FailureKind::Transmission);
        assert!(failed.to_string().contains("reset"));
        assert!(std::error::Error::source(&failed).is_some());
    }

    #[test]
    fn test_serialization_is_transmission() {
        let err = serde_json::from_str::<u32>("nope").unwrap_err();
        let mapped = BrokerError::serialization(BackendKind::Socket, err);
        assert_eq!(mapped.kind(), FailureKind::Transmission);
        assert!(mapped.to_string().starts_with("socket: transmission failed: serialization failed"));
    }

    #[test]
    fn test_config_has_no_backend() {
        let err = BrokerError::Config("max_connections must be positive".into());
        assert_eq!(err.backend(), None);
        assert!(!err.is_cancelled());
    }
}
