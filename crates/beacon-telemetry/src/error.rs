//! Error types for the delivery pipeline

use thiserror::Error;

/// Errors produced by the telemetry pipeline.
///
/// Nothing in this taxonomy propagates through [`track`](crate::TelemetryClient::track);
/// delivery failures are absorbed and reflected in queue/store state. Only
/// construction-time configuration errors and the disposed condition surface
/// to callers.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Invalid construction parameters. Fatal at client construction.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Invalid event name or properties.
    #[error("invalid event: {0}")]
    Event(String),

    /// The offline store is unavailable or an operation on it failed.
    #[error("offline store failure ({context}): {source}")]
    Storage {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Operation on a store that was never initialized or already closed.
    #[error("offline store is not initialized")]
    StoreNotInitialized,

    /// Transport failure. `status` is `None` for connection-level errors
    /// (DNS, refused connection, timeout) that never produced a response.
    #[error("delivery failed (status {status:?}): {message}")]
    Network {
        status: Option<u16>,
        message: String,
    },

    /// Event or payload (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The client has been disposed.
    #[error("telemetry client has been disposed")]
    Disposed,
}

impl TelemetryError {
    /// Whether a delivery failure is transient and eligible for another attempt.
    ///
    /// Retryable: no status at all (network error, timeout), 408, 429, and 5xx.
    /// Everything else fails fast.
    pub fn is_retryable(&self) -> bool {
        match self {
            TelemetryError::Network { status, .. } => match status {
                None => true,
                Some(code) => matches!(code, 408 | 429) || (500..600).contains(code),
            },
            _ => false,
        }
    }
}

/// Result type alias for telemetry operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn network(status: Option<u16>) -> TelemetryError {
        TelemetryError::Network {
            status,
            message: "test".to_string(),
        }
    }

    #[test]
    fn test_retryable_statuses() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(
                network(Some(status)).is_retryable(),
                "status {status} should be retryable"
            );
        }
    }

    #[test]
    fn test_non_retryable_statuses() {
        for status in [400, 401, 403, 404, 422] {
            assert!(
                !network(Some(status)).is_retryable(),
                "status {status} should not be retryable"
            );
        }
    }

    #[test]
    fn test_missing_status_is_retryable() {
        assert!(network(None).is_retryable());
    }

    #[test]
    fn test_non_network_errors_not_retryable() {
        assert!(!TelemetryError::Config("bad".to_string()).is_retryable());
        assert!(!TelemetryError::StoreNotInitialized.is_retryable());
        assert!(!TelemetryError::Disposed.is_retryable());
    }
}
