//! Error taxonomy for the dispatch core.

use docstore::StoreError;
use thiserror::Error;

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// No provider passed the health and quota filters.
    #[error("No mail providers are configured and available")]
    NoProvidersAvailable,

    /// Every eligible provider was tried and every attempt failed.
    #[error("All providers failed; last error: {last}")]
    AllProvidersFailed { last: String },

    /// The lock is held by another worker.
    #[error("Lock '{key}' is held by another worker")]
    LockConflict { key: String },

    /// The lock backend could not be reached. Distinct from
    /// `LockConflict` so callers never mistake an outage for contention.
    #[error("Lock backend error for '{key}': {detail}")]
    LockBackend { key: String, detail: String },

    /// A provider did not answer within the per-attempt deadline.
    #[error("Provider '{provider}' timed out after {timeout_ms}ms")]
    TransportTimeout { provider: String, timeout_ms: u64 },

    /// A provider answered with an error or the request failed outright.
    #[error("Provider '{provider}' delivery failed: {detail}")]
    TransportError {
        provider: String,
        status: Option<u16>,
        detail: String,
    },

    /// Template rendering failed; the job payload is malformed.
    #[error("Template error: {0}")]
    Template(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Machine-readable code surfaced on API responses and logs.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::NoProvidersAvailable => "NO_PROVIDER_CONFIGURED",
            DispatchError::AllProvidersFailed { .. } => "ALL_PROVIDERS_FAILED",
            DispatchError::LockConflict { .. } => "LOCK_CONFLICT",
            DispatchError::LockBackend { .. } => "LOCK_BACKEND_ERROR",
            DispatchError::TransportTimeout { .. } => "TRANSPORT_TIMEOUT",
            DispatchError::TransportError { .. } => "TRANSPORT_ERROR",
            DispatchError::Template(_) => "TEMPLATE_ERROR",
            DispatchError::Store(_) => "STORE_ERROR",
            DispatchError::Config(_) => "CONFIG_ERROR",
            DispatchError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether a later attempt could plausibly succeed. Template errors
    /// are permanent; everything else is environmental.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DispatchError::Template(_) | DispatchError::Config(_))
    }
}

impl From<handlebars::RenderError> for DispatchError {
    fn from(err: handlebars::RenderError) -> Self {
        DispatchError::Template(err.to_string())
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Internal(err.to_string())
    }
}

impl From<core_config::ConfigError> for DispatchError {
    fn from(err: core_config::ConfigError) -> Self {
        DispatchError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            DispatchError::NoProvidersAvailable.code(),
            "NO_PROVIDER_CONFIGURED"
        );
        assert_eq!(
            DispatchError::LockConflict {
                key: "queue".into()
            }
            .code(),
            "LOCK_CONFLICT"
        );
        assert_eq!(
            DispatchError::Store(StoreError::Backend("down".into())).code(),
            "STORE_ERROR"
        );
    }

    #[test]
    fn test_template_errors_are_permanent() {
        assert!(!DispatchError::Template("missing variable".into()).is_retryable());
        assert!(DispatchError::TransportTimeout {
            provider: "primary".into(),
            timeout_ms: 8000
        }
        .is_retryable());
        assert!(DispatchError::Store(StoreError::Backend("down".into())).is_retryable());
    }
}
