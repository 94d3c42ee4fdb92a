//! Error taxonomy for the credential lifecycle.
//!
//! Every caller-facing failure maps to one [`CredentialError`] variant.
//! Messages carry enough context to route the user to re-authentication or
//! "try again later", and never contain token material, the master secret,
//! or ciphertext.

use std::fmt;
use thiserror::Error;

/// Why a refresh did not produce a new credential.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshFailure {
    /// The provider rejected the refresh token (revoked, expired, invalid_grant).
    /// The stored credential has been discarded.
    Rejected(String),
    /// Network, provider-side or storage trouble. The stored credential is kept.
    Transient(String),
}

impl fmt::Display for RefreshFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshFailure::Rejected(reason) => write!(f, "rejected by provider: {}", reason),
            RefreshFailure::Transient(reason) => write!(f, "transient failure: {}", reason),
        }
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credential stored for this identity")]
    NotFound,

    #[error("stored credential could not be decrypted (tampered, stale, or wrong master secret)")]
    DecryptionFailed,

    #[error("authorization state does not match a pending request (possible CSRF attempt)")]
    StateMismatch,

    #[error("authorization request expired before the callback arrived")]
    StateExpired,

    #[error("authorization code exchange failed: {0}")]
    ExchangeFailed(String),

    #[error("token refresh failed: {0}")]
    RefreshFailed(RefreshFailure),

    #[error("timed out waiting for the authorization callback")]
    Timeout,

    #[error("credential storage error: {0}")]
    Storage(String),

    #[error("not authenticated; run the authorization flow")]
    Unauthenticated,

    #[error("callback listener error: {0}")]
    Listen(String),

    #[error("authorization denied by provider: {0}")]
    AuthorizationDenied(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl CredentialError {
    /// True when the only way forward is a fresh authorization flow.
    ///
    /// False means the failure is transient and the same call may succeed later.
    pub fn requires_reauthorization(&self) -> bool {
        match self {
            CredentialError::Unauthenticated
            | CredentialError::NotFound
            | CredentialError::DecryptionFailed
            | CredentialError::StateMismatch
            | CredentialError::StateExpired
            | CredentialError::AuthorizationDenied(_)
            | CredentialError::ExchangeFailed(_) => true,
            CredentialError::RefreshFailed(reason) => {
                matches!(reason, RefreshFailure::Rejected(_))
            }
            CredentialError::Timeout
            | CredentialError::Storage(_)
            | CredentialError::Listen(_)
            | CredentialError::Config(_) => false,
        }
    }
}

impl From<std::io::Error> for CredentialError {
    fn from(e: std::io::Error) -> Self {
        CredentialError::Storage(e.to_string())
    }
}

pub type Result<T, E = CredentialError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reauthorization_routing() {
        assert!(CredentialError::Unauthenticated.requires_reauthorization());
        assert!(CredentialError::DecryptionFailed.requires_reauthorization());
        assert!(CredentialError::StateMismatch.requires_reauthorization());
        assert!(CredentialError::RefreshFailed(RefreshFailure::Rejected(
            "invalid_grant".to_string()
        ))
        .requires_reauthorization());

        assert!(!CredentialError::RefreshFailed(RefreshFailure::Transient(
            "connection reset".to_string()
        ))
        .requires_reauthorization());
        assert!(!CredentialError::Timeout.requires_reauthorization());
        assert!(!CredentialError::Storage("disk full".to_string()).requires_reauthorization());
    }

    #[test]
    fn test_messages_are_actionable() {
        let msg = CredentialError::Unauthenticated.to_string();
        assert!(msg.contains("authorization flow"));

        let msg = CredentialError::RefreshFailed(RefreshFailure::Rejected(
            "invalid_grant".to_string(),
        ))
        .to_string();
        assert!(msg.contains("rejected by provider"));
    }
}
