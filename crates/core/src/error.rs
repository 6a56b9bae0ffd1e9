//! Shared error taxonomy.

use thiserror::Error;

/// Result type used across the orchestration core.
pub type GenerationResult<T> = Result<T, GenerationError>;

/// Orchestration-level error.
///
/// Two broad categories live here with different propagation policy:
/// *permanent* errors (caller's fault or a definitive vendor rejection) are
/// never retried, while *transient* errors (network, 5xx, timeouts on the
/// wire) are retried by the poll loop and count toward circuit-breaker trips.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// Malformed input. Never retried, never counted by the breaker.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Balance is below the price of the requested generation.
    #[error("insufficient credits: need {required}, have {available}")]
    InsufficientCredits { required: i64, available: i64 },

    /// No semaphore slot became free within the wait budget.
    #[error("provider capacity busy: {scope}")]
    AcquireTimeout { scope: String },

    /// The circuit for this provider key is open; the call never went out.
    #[error("circuit open for {key}, retry in {retry_in_ms}ms")]
    CircuitOpen { key: String, retry_in_ms: u64 },

    /// Network failure, 5xx, or wire timeout. Retryable.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The vendor rejected the job (4xx business rejection). Terminal.
    #[error("provider rejected: {0}")]
    ProviderRejected(String),

    /// A requested resource does not exist.
    #[error("not found")]
    NotFound,

    /// A conflicting write was detected (e.g. stale state guard).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Storage-layer failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl GenerationError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn provider_unavailable(msg: impl Into<String>) -> Self {
        Self::ProviderUnavailable(msg.into())
    }

    pub fn provider_rejected(msg: impl Into<String>) -> Self {
        Self::ProviderRejected(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Transient errors may resolve on their own; callers poll again later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ProviderUnavailable(_))
    }

    /// Only evidence that the provider itself is failing moves the breaker.
    ///
    /// A malformed request or a business rejection says nothing about
    /// provider health, and protection errors never reached the network.
    pub fn counts_toward_breaker(&self) -> bool {
        self.is_transient()
    }

    /// Errors the caller may simply retry later without any state change.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable(_) | Self::AcquireTimeout { .. } | Self::CircuitOpen { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_counts_toward_breaker() {
        assert!(GenerationError::provider_unavailable("503").counts_toward_breaker());

        for err in [
            GenerationError::validation("bad prompt"),
            GenerationError::provider_rejected("nsfw"),
            GenerationError::InsufficientCredits {
                required: 10,
                available: 2,
            },
            GenerationError::AcquireTimeout {
                scope: "kie:video".into(),
            },
            GenerationError::CircuitOpen {
                key: "kie:video".into(),
                retry_in_ms: 5_000,
            },
        ] {
            assert!(!err.counts_toward_breaker(), "{err} must not count");
        }
    }

    #[test]
    fn protection_errors_are_retryable_but_not_transient() {
        let acquire = GenerationError::AcquireTimeout {
            scope: "kie:photo".into(),
        };
        assert!(acquire.is_retryable());
        assert!(!acquire.is_transient());
    }
}
