use bridge_traits::error::BridgeError;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Token refresh failed: {0}")]
    TokenRefreshFailed(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Session invalidated: {0}")]
    SessionInvalidated(String),

    #[error("Superseded by a newer session change")]
    Superseded,
}

/// Coarse error classes surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Bad credentials, expired or rejected token. Never retried.
    Authentication,
    /// Transport failure, shown as a generic message.
    Network,
    /// Refresh failure. Always ends the session.
    Refresh,
    /// Local data or input problems.
    Validation,
    /// Session ended by another tab, a revalidation, or a concurrent change.
    SessionInvalidated,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Network => "network",
            ErrorCategory::Refresh => "refresh",
            ErrorCategory::Validation => "validation",
            ErrorCategory::SessionInvalidated => "session_invalidated",
        };
        f.write_str(name)
    }
}

impl AuthError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            AuthError::InvalidCredentials(_)
            | AuthError::Rejected(_)
            | AuthError::Unauthorized
            | AuthError::NotAuthenticated => ErrorCategory::Authentication,
            AuthError::Network(_) | AuthError::Timeout(_) | AuthError::InvalidResponse(_) => {
                ErrorCategory::Network
            }
            AuthError::TokenRefreshFailed(_) => ErrorCategory::Refresh,
            AuthError::Storage(_) | AuthError::Validation(_) => ErrorCategory::Validation,
            AuthError::SessionInvalidated(_) | AuthError::Superseded => {
                ErrorCategory::SessionInvalidated
            }
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, AuthError::Unauthorized)
    }

    /// Map a transport-level bridge failure.
    pub(crate) fn from_transport(err: BridgeError) -> Self {
        match err {
            BridgeError::Timeout(msg) => AuthError::Timeout(msg),
            other => AuthError::Network(other.to_string()),
        }
    }

    pub(crate) fn from_storage(err: BridgeError) -> Self {
        AuthError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            AuthError::InvalidCredentials("bad".into()).category(),
            ErrorCategory::Authentication
        );
        assert_eq!(AuthError::Unauthorized.category(), ErrorCategory::Authentication);
        assert_eq!(AuthError::Network("down".into()).category(), ErrorCategory::Network);
        assert_eq!(
            AuthError::TokenRefreshFailed("rejected".into()).category(),
            ErrorCategory::Refresh
        );
        assert_eq!(AuthError::Storage("io".into()).category(), ErrorCategory::Validation);
        assert_eq!(AuthError::Superseded.category(), ErrorCategory::SessionInvalidated);
    }

    #[test]
    fn test_transport_timeout_is_preserved() {
        let err = AuthError::from_transport(BridgeError::Timeout("30s".into()));
        assert_eq!(err, AuthError::Timeout("30s".into()));

        let err = AuthError::from_transport(BridgeError::OperationFailed("reset".into()));
        assert!(matches!(err, AuthError::Network(_)));
    }
}
