//! Error types for location providers.

use thiserror::Error;

/// Errors that can occur when fetching a location.
///
/// None of these are fatal to a tick: the caller falls back to the cached
/// sample and tries again on the next tick.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider could not be reached or kept failing after retries.
    #[error("location provider unavailable: {0}")]
    Unavailable(String),

    /// The provider rejected our credentials.
    #[error("location provider authentication failed: {0}")]
    Auth(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider answered with something we could not interpret.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The provider is missing required configuration.
    #[error("provider misconfigured: {0}")]
    Config(String),
}

impl ProviderError {
    /// Whether retrying the same request might succeed.
    ///
    /// Only connection failures and timeouts count; a request that could not
    /// even be built fails the same way every time.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Unavailable(_) => true,
            ProviderError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

/// A geofence definition that failed validation.
#[derive(Debug, Error)]
#[error("invalid location '{name}': {reason}")]
pub struct InvalidLocation {
    pub name: String,
    pub reason: String,
}
