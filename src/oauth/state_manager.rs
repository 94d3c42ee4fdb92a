//! OAuth state management for CSRF protection.
//!
//! Tracks the single in-flight [`AuthorizationRequest`] per identity. A
//! request is taken out of the map by the first completion attempt, so it can
//! never be used twice.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Random bytes in a state token
const STATE_TOKEN_BYTES: usize = 32;

/// One in-flight authorization attempt.
#[derive(Clone)]
pub struct AuthorizationRequest {
    pub identity: String,
    pub state_token: String,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
    pub redirect_uri: String,
    pub(crate) pkce_verifier: String,
}

impl AuthorizationRequest {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + self.ttl
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

impl fmt::Debug for AuthorizationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationRequest")
            .field("identity", &self.identity)
            .field("created_at", &self.created_at)
            .field("ttl", &self.ttl)
            .field("redirect_uri", &self.redirect_uri)
            .finish_non_exhaustive()
    }
}

/// Generates an unguessable state token (32 bytes from the OS RNG, base64url).
pub fn generate_state_token() -> String {
    let mut bytes = [0u8; STATE_TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Pending authorization requests with automatic expiration
#[derive(Clone)]
pub struct StateManager {
    requests: Arc<Mutex<HashMap<String, AuthorizationRequest>>>,
    ttl: Duration,
}

impl StateManager {
    /// Create a new state manager
    ///
    /// # Arguments
    /// * `ttl_seconds` - How long a request remains valid (default: 600 = 10 minutes)
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            requests: Arc::new(Mutex::new(HashMap::new())),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    /// Records a new request for `identity`, replacing any previous one.
    pub fn create(
        &self,
        identity: &str,
        redirect_uri: &str,
        pkce_verifier: String,
    ) -> AuthorizationRequest {
        let request = AuthorizationRequest {
            identity: identity.to_string(),
            state_token: generate_state_token(),
            created_at: Utc::now(),
            ttl: self.ttl,
            redirect_uri: redirect_uri.to_string(),
            pkce_verifier,
        };

        if self
            .lock()
            .insert(identity.to_string(), request.clone())
            .is_some()
        {
            tracing::debug!(identity = %identity, "Replaced pending authorization request");
        }

        request
    }

    /// Removes and returns the pending request for `identity` (single-use).
    pub fn take(&self, identity: &str) -> Option<AuthorizationRequest> {
        self.lock().remove(identity)
    }

    /// True when `identity` has an unexpired pending request.
    pub fn is_pending(&self, identity: &str) -> bool {
        let now = Utc::now();
        self.lock()
            .get(identity)
            .map(|r| !r.is_expired(now))
            .unwrap_or(false)
    }

    /// Clean up expired requests (called periodically). Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut requests = self.lock();
        let before = requests.len();
        requests.retain(|_, request| !request.is_expired(now));
        before - requests.len()
    }

    /// Get count of pending requests (for debugging/monitoring)
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, AuthorizationRequest>> {
        self.requests.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Background task to periodically clean up expired requests.
///
/// An interval of zero is treated as one second.
pub async fn run_state_cleanup(manager: StateManager, interval_seconds: u64) {
    let mut interval =
        tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds.max(1)));

    loop {
        interval.tick().await;
        let removed = manager.cleanup_expired();
        if removed > 0 {
            tracing::debug!(
                removed,
                remaining = manager.count(),
                "Expired OAuth authorization requests removed"
            );
        }
    }
}
