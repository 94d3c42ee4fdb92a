//! OAuth provider endpoints, authorization URL construction and PKCE.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Length of the PKCE verifier in random bytes (43 base64url chars)
const PKCE_VERIFIER_BYTES: usize = 32;

/// OAuth provider configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// OAuth authorization endpoint URL
    pub auth_url: String,

    /// OAuth token exchange endpoint URL
    pub token_url: String,

    /// Token revocation endpoint URL (RFC 7009), if the provider has one
    pub revoke_url: Option<String>,

    /// Requested OAuth scopes
    pub scopes: Vec<String>,

    pub client_id: String,

    /// Absent for public clients, which rely on PKCE alone
    pub client_secret: Option<String>,

    /// Redirect URI registered with the provider; must point at the callback listener
    pub redirect_uri: String,

    /// Extra query parameters for the authorization URL (e.g. `access_type=offline`)
    #[serde(default)]
    pub extra_auth_params: Vec<(String, String)>,
}

impl ProviderConfig {
    /// Builds the authorization URL for one flow.
    pub fn build_auth_url(&self, state: &str, code_challenge: &str) -> String {
        let scopes = self.scopes.join(" ");
        let mut url = format!(
            "{}?client_id={}&redirect_uri={}&scope={}&state={}&response_type=code&code_challenge={}&code_challenge_method=S256",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state),
            urlencoding::encode(code_challenge),
        );

        for (key, value) in &self.extra_auth_params {
            url.push('&');
            url.push_str(&urlencoding::encode(key));
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        }

        url
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("revoke_url", &self.revoke_url)
            .field("scopes", &self.scopes)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

/// PKCE code verifier and its S256 challenge.
#[derive(Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

/// Generates a PKCE verifier (43 unreserved characters) and S256 challenge.
pub fn generate_pkce_pair() -> PkcePair {
    let mut bytes = [0u8; PKCE_VERIFIER_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let verifier = URL_SAFE_NO_PAD.encode(bytes);
    let challenge = pkce_challenge(&verifier);

    PkcePair {
        verifier,
        challenge,
    }
}

/// base64url(SHA-256(verifier)), no padding.
pub fn pkce_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}
