//! OAuth token endpoint calls.
//!
//! Handles exchanging authorization codes, refreshing access tokens and
//! revoking tokens. [`TokenEndpoint`] is the seam the flow controller and the
//! refresh coordinator talk to; [`HttpTokenEndpoint`] is the reqwest-backed
//! implementation.

use super::provider::ProviderConfig;
use crate::credentials::Credential;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::fmt;

/// Expiry assumed when the provider omits `expires_in`
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Longest token lifetime accepted from a provider (one year)
const MAX_EXPIRES_IN_SECS: i64 = 365 * 24 * 60 * 60;

/// OAuth error codes that mean the grant itself is dead
const GRANT_REJECTION_ERRORS: &[&str] = &["invalid_grant"];

/// Timeout for a single token endpoint request
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// OAuth token response (standard OAuth 2.0)
#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl TokenResponse {
    /// Converts the response into a credential issued at `now`.
    ///
    /// Fields the provider omitted on a refresh (refresh token, scopes) are
    /// carried over from `previous`. Lifetimes above one year are capped;
    /// a negative `expires_in` is an unusable response.
    pub fn into_credential(
        self,
        identity: &str,
        previous: Option<&Credential>,
        now: DateTime<Utc>,
    ) -> Result<Credential, EndpointError> {
        let expires_in = self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        if expires_in < 0 {
            return Err(EndpointError::Transient(format!(
                "token response has negative expires_in ({})",
                expires_in
            )));
        }
        let expires_in = expires_in.min(MAX_EXPIRES_IN_SECS);

        let scopes = match self.scope {
            Some(scope) => scope.split_whitespace().map(String::from).collect(),
            None => previous.map(|p| p.scopes.clone()).unwrap_or_default(),
        };

        // Keep the existing refresh token if the provider did not rotate it
        let refresh_token = self
            .refresh_token
            .or_else(|| previous.and_then(|p| p.refresh_token.clone()));

        Ok(Credential {
            identity: identity.to_string(),
            access_token: self.access_token,
            refresh_token,
            expiry: now + Duration::seconds(expires_in),
            scopes,
            issued_at: now,
        })
    }
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// Failure talking to the token endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndpointError {
    /// The provider reported `invalid_grant`: the code or refresh token is
    /// dead and retrying cannot help.
    Rejected(String),
    /// Anything else: network failure, timeout, non-grant HTTP errors or an
    /// unreadable response. The credential is kept.
    Transient(String),
}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointError::Rejected(reason) => write!(f, "{}", reason),
            EndpointError::Transient(reason) => write!(f, "{}", reason),
        }
    }
}

/// Provider token endpoint.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Exchanges an authorization code (plus PKCE verifier) for tokens.
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        pkce_verifier: &str,
    ) -> Result<TokenResponse, EndpointError>;

    /// Obtains a new access token with a refresh token.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, EndpointError>;

    /// Revokes a token at the provider. Providers without a revocation
    /// endpoint succeed trivially.
    async fn revoke(&self, token: &str) -> Result<(), EndpointError>;
}

/// OAuth error body (RFC 6749 §5.2)
#[derive(Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Token endpoint over HTTPS.
pub struct HttpTokenEndpoint {
    client: reqwest::Client,
    token_url: String,
    revoke_url: Option<String>,
    client_id: String,
    client_secret: Option<String>,
}

impl HttpTokenEndpoint {
    pub fn new(provider: &ProviderConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to build configured HTTP client, using defaults");
                reqwest::Client::new()
            });

        Self {
            client,
            token_url: provider.token_url.clone(),
            revoke_url: provider.revoke_url.clone(),
            client_id: provider.client_id.clone(),
            client_secret: provider.client_secret.clone(),
        }
    }

    async fn post_token_form<'a>(
        &'a self,
        mut form: Vec<(&'a str, &'a str)>,
    ) -> Result<TokenResponse, EndpointError> {
        form.push(("client_id", self.client_id.as_str()));
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let response = self
            .client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| EndpointError::Transient(format!("token request failed: {}", e.without_url())))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, &body));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|_| EndpointError::Transient("token response could not be parsed".to_string()))
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        pkce_verifier: &str,
    ) -> Result<TokenResponse, EndpointError> {
        tracing::debug!(token_url = %self.token_url, "Exchanging authorization code for token");

        let response = self
            .post_token_form(vec![
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("code_verifier", pkce_verifier),
            ])
            .await?;

        tracing::debug!(
            has_refresh_token = response.refresh_token.is_some(),
            expires_in = ?response.expires_in,
            "Token exchange successful"
        );
        Ok(response)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, EndpointError> {
        tracing::debug!(token_url = %self.token_url, "Refreshing access token");

        self.post_token_form(vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn revoke(&self, token: &str) -> Result<(), EndpointError> {
        let Some(revoke_url) = &self.revoke_url else {
            tracing::debug!("Provider has no revocation endpoint, skipping remote revoke");
            return Ok(());
        };

        let response = self
            .client
            .post(revoke_url)
            .form(&[("token", token)])
            .send()
            .await
            .map_err(|e| EndpointError::Transient(format!("revoke request failed: {}", e.without_url())))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status, &body))
    }
}

/// Maps a non-success response to an [`EndpointError`].
///
/// Only an explicit `invalid_grant` is a rejection. Misconfigured endpoints,
/// client errors and proxies answering 404 leave the credential alone.
/// Only the `error` / `error_description` fields of the body are kept so
/// nothing else the provider echoes back ends up in logs.
fn classify_failure(status: StatusCode, body: &str) -> EndpointError {
    let Ok(err) = serde_json::from_str::<OAuthErrorBody>(body) else {
        return EndpointError::Transient(format!("HTTP {}", status.as_u16()));
    };

    let summary = match &err.error_description {
        Some(description) => format!("{} ({}): {}", err.error, status.as_u16(), description),
        None => format!("{} ({})", err.error, status.as_u16()),
    };

    if status.is_client_error() && GRANT_REJECTION_ERRORS.contains(&err.error.as_str()) {
        EndpointError::Rejected(summary)
    } else {
        EndpointError::Transient(summary)
    }
}
