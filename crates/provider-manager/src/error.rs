//! Error types for provider calls
//!
//! Provider failures are classified at the adapter boundary so the retry
//! and failover layers can tell transient conditions from terminal ones.

use std::time::Duration;
use thiserror::Error;

/// Provider call error types
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Request could not reach the provider (DNS, connect, TLS)
    #[error("network error: {0}")]
    Network(String),

    /// Provider did not answer within the deadline
    #[error("provider timed out after {0:?}")]
    Timeout(Duration),

    /// Provider returned a 5xx or an explicit retriable status
    #[error("retriable provider error (status {status}): {message}")]
    Retriable { status: u16, message: String },

    /// Provider returned a 4xx client error
    #[error("provider rejected the request (status {status}): {message}")]
    Client { status: u16, message: String },

    /// Local rate limit exceeded before the request was sent
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Response body did not match the expected shape
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    /// Provider kind is not admissible under the air-gapped policy
    #[error("provider blocked by air-gapped policy: {0}")]
    Blocked(String),

    /// Provider is not registered or its credential cannot be resolved
    #[error("provider configuration error: {0}")]
    Config(String),

    /// Every candidate provider failed terminally
    #[error("all providers exhausted: {0}")]
    Exhausted(String),
}

impl ProviderError {
    /// Transient failures worth retrying on the same provider
    ///
    /// Rate limits are excluded: the caller decides whether to wait,
    /// retrying internally would just burn the budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Network(_)
                | ProviderError::Timeout(_)
                | ProviderError::Retriable { .. }
        )
    }

    /// Failures that count against a provider's health
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProviderError::Network(_)
                | ProviderError::Timeout(_)
                | ProviderError::Retriable { .. }
                | ProviderError::MalformedResponse(_)
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(Duration::ZERO)
        } else if err.is_connect() || err.is_request() {
            ProviderError::Network(err.to_string())
        } else if let Some(status) = err.status() {
            if status.is_server_error() {
                ProviderError::Retriable {
                    status: status.as_u16(),
                    message: err.to_string(),
                }
            } else {
                ProviderError::Client {
                    status: status.as_u16(),
                    message: err.to_string(),
                }
            }
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

/// Convenience result type for provider operations
pub type ProviderResult<T> = Result<T, ProviderError>;
