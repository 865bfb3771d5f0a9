use std::time::Duration;

use thiserror::Error;

use crate::providers::ProviderError;

/// Errors from the provisioning HTTP API.
///
/// SECURITY: Error messages must NEVER contain the API token.
#[derive(Debug, Error)]
pub enum RestError {
    /// Authentication failed (invalid or expired token)
    #[error("authentication failed: {message}")]
    Auth { message: String },

    /// API returned an error response
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Network-level error (connection failed, timeout, etc.)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("not found: {resource}")]
    NotFound { resource: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<RestError> for ProviderError {
    fn from(err: RestError) -> Self {
        match err {
            RestError::RateLimited { retry_after } => ProviderError::Transient {
                message: err.to_string(),
                retry_after: Some(Duration::from_secs(retry_after)),
            },
            RestError::Api { status, .. } if status >= 500 => ProviderError::transient(err.to_string()),
            RestError::Network(_) => ProviderError::transient(err.to_string()),
            RestError::Auth { .. } | RestError::Api { .. } => ProviderError::Rejected {
                message: err.to_string(),
            },
            RestError::NotFound { resource } => ProviderError::NotFound { resource },
            RestError::InvalidResponse(message) => ProviderError::InvalidResponse(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_token_is_rejection() {
        let err: ProviderError = RestError::Auth {
            message: "token expired for project groundwork-dev".to_string(),
        }
        .into();
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "request rejected: authentication failed: token expired for project groundwork-dev"
        );
    }

    #[test]
    fn test_server_errors_are_transient() {
        let err: ProviderError = RestError::Api {
            status: 503,
            message: "control plane unavailable".to_string(),
        }
        .into();
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), None);
        assert_eq!(
            err.to_string(),
            "transient failure: API error (503): control plane unavailable"
        );
    }

    #[test]
    fn test_client_errors_are_rejections() {
        let err: ProviderError = RestError::Api {
            status: 422,
            message: "cidr overlaps".to_string(),
        }
        .into();
        assert!(matches!(err, ProviderError::Rejected { .. }));
        assert!(err.to_string().contains("cidr overlaps"));
    }

    #[test]
    fn test_rate_limit_carries_requested_wait() {
        let err: ProviderError = RestError::RateLimited { retry_after: 7 }.into();
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(err.to_string(), "transient failure: rate limited, retry after 7s");
    }

    #[test]
    fn test_not_found_conversion() {
        let err: ProviderError = RestError::NotFound {
            resource: "network/vpc-1".to_string(),
        }
        .into();
        assert!(matches!(err, ProviderError::NotFound { resource } if resource == "network/vpc-1"));
    }
}
