//! Error taxonomy for the mirror: provider, store, and sync-level errors.

use thiserror::Error;

/// Errors from the remote calendar provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("authorization missing or rejected")]
    Unauthorized,

    #[error("rate limited, retry after {0} seconds")]
    RateLimited(u64),

    #[error("provider error: {0}")]
    Api(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl ProviderError {
    /// Whether the engine may recover locally (full-sync retry, cache
    /// fallback). Credential failures are fatal to the request.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Unauthorized)
    }
}

/// Errors from the persistent cache store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("corrupt cache row: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Tagged result surfaced by the synchronize entry point.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("authorization required")]
    Unauthorized,

    #[error("calendar provider unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("event store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

impl SyncError {
    /// User-friendly message for UI display.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Unauthorized => "Please sign in to your calendar account.",
            Self::UpstreamUnavailable(_) => {
                "Calendar service is unreachable. Check your connection."
            }
            Self::StoreUnavailable(_) => "Local calendar cache is unavailable.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_provider_errors() {
        assert!(!ProviderError::Unauthorized.is_recoverable());
        assert!(ProviderError::RateLimited(30).is_recoverable());
        assert!(ProviderError::Api("500: boom".into()).is_recoverable());
    }

    #[test]
    fn test_user_messages() {
        assert!(SyncError::Unauthorized.user_message().contains("sign in"));
        assert!(SyncError::UpstreamUnavailable("down".into())
            .user_message()
            .contains("unreachable"));
    }
}
