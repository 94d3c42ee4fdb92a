//! OAuth 2.0 authorization code flow.
//!
//! Implements the authorization code flow for one identity at a time:
//! 1. [`AuthorizationFlowController::begin`] records a pending request and
//!    builds the provider URL (state token + PKCE challenge)
//! 2. User authorizes on the provider's site
//! 3. Provider redirects to the local [`CallbackListener`]
//! 4. [`AuthorizationFlowController::complete`] consumes the pending request,
//!    checks the state and exchanges the code for tokens
//! 5. The caller persists the resulting [`Credential`]
//!
//! ```text
//!            begin()                   complete() ok
//!   Idle ─────────────▶ Pending ───────────────────▶ Authorized
//!    ▲                     │
//!    └─────────────────────┘  complete() failed / TTL elapsed
//! ```

mod callback;
mod exchange;
mod provider;
mod state_manager;

pub use callback::{listen, CallbackListener, CallbackParams};
pub use exchange::{EndpointError, HttpTokenEndpoint, TokenEndpoint, TokenResponse};
pub use provider::{generate_pkce_pair, pkce_challenge, PkcePair, ProviderConfig};
pub use state_manager::{
    generate_state_token, run_state_cleanup, AuthorizationRequest, StateManager,
};

use crate::credentials::Credential;
use crate::error::{CredentialError, Result};
use chrono::Utc;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

/// Where an identity is in the authorization flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    PendingAuthorization,
}

/// Drives the authorization code exchange.
///
/// Holds the pending [`AuthorizationRequest`]s; it never touches the token
/// store. Persisting the returned [`Credential`] is the caller's job.
#[derive(Clone)]
pub struct AuthorizationFlowController {
    provider: ProviderConfig,
    endpoint: Arc<dyn TokenEndpoint>,
    states: StateManager,
}

impl AuthorizationFlowController {
    pub fn new(
        provider: ProviderConfig,
        endpoint: Arc<dyn TokenEndpoint>,
        state_ttl_secs: i64,
    ) -> Self {
        Self {
            provider,
            endpoint,
            states: StateManager::new(state_ttl_secs),
        }
    }

    /// Starts a flow for `identity`, replacing any pending one.
    ///
    /// Returns the URL to send the user to and the recorded request.
    pub fn begin(&self, identity: &str) -> (String, AuthorizationRequest) {
        let pkce = generate_pkce_pair();
        let request = self
            .states
            .create(identity, &self.provider.redirect_uri, pkce.verifier);
        let url = self
            .provider
            .build_auth_url(&request.state_token, &pkce.challenge);

        info!(
            identity = %identity,
            expires_at = %request.expires_at(),
            "Authorization flow started"
        );

        (url, request)
    }

    /// Finishes the flow for `identity` with the callback's `code` and `state`.
    ///
    /// The pending request is consumed before anything is checked, so a
    /// second attempt with the same state fails with `StateMismatch` whatever
    /// the outcome of the first.
    pub async fn complete(&self, identity: &str, code: &str, state: &str) -> Result<Credential> {
        let Some(request) = self.states.take(identity) else {
            warn!(identity = %identity, "No pending authorization request");
            return Err(CredentialError::StateMismatch);
        };

        let now = Utc::now();
        if request.is_expired(now) {
            warn!(
                identity = %identity,
                expired_at = %request.expires_at(),
                "Authorization request expired"
            );
            return Err(CredentialError::StateExpired);
        }

        if !bool::from(request.state_token.as_bytes().ct_eq(state.as_bytes())) {
            warn!(identity = %identity, "Authorization state mismatch");
            return Err(CredentialError::StateMismatch);
        }

        debug!(identity = %identity, "State verified, exchanging authorization code");

        let credential = self
            .endpoint
            .exchange_code(code, &request.redirect_uri, &request.pkce_verifier)
            .await
            .and_then(|response| response.into_credential(identity, None, Utc::now()))
            .map_err(|e| {
                warn!(identity = %identity, error = %e, "Authorization code exchange failed");
                CredentialError::ExchangeFailed(e.to_string())
            })?;

        info!(
            identity = %identity,
            expiry = %credential.expiry,
            has_refresh_token = credential.refresh_token.is_some(),
            "Authorization completed"
        );

        Ok(credential)
    }

    pub fn flow_state(&self, identity: &str) -> FlowState {
        if self.states.is_pending(identity) {
            FlowState::PendingAuthorization
        } else {
            FlowState::Idle
        }
    }

    pub fn state_manager(&self) -> &StateManager {
        &self.states
    }

    pub fn provider(&self) -> &ProviderConfig {
        &self.provider
    }
}
