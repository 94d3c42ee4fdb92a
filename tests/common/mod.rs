// Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use credvault::cache::CacheSettings;
use credvault::credentials::{Credential, EncryptedTokenStore, KdfParams};
use credvault::manager::{CredentialManager, ListenerSettings, ManagerSettings};
use credvault::oauth::{EndpointError, ProviderConfig, TokenEndpoint, TokenResponse};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Cheap KDF settings so tests don't spend time in Argon2
pub fn fast_kdf() -> KdfParams {
    KdfParams {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
        ..KdfParams::default()
    }
}

/// How the fake provider answers refresh requests
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    Succeed,
    Reject,
    Unavailable,
}

/// In-memory token endpoint counting every call
pub struct FakeProvider {
    pub exchanges: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub revocations: Mutex<Vec<String>>,
    pub refresh_mode: Mutex<RefreshMode>,
    pub refresh_delay: std::time::Duration,
    pub revoke_fails: bool,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            exchanges: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            revocations: Mutex::new(Vec::new()),
            refresh_mode: Mutex::new(RefreshMode::Succeed),
            refresh_delay: std::time::Duration::ZERO,
            revoke_fails: false,
        }
    }

    pub fn with_refresh_delay(mut self, delay: std::time::Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    pub fn with_failing_revoke(mut self) -> Self {
        self.revoke_fails = true;
        self
    }

    pub fn set_refresh_mode(&self, mode: RefreshMode) {
        *self.refresh_mode.lock().unwrap() = mode;
    }

    pub fn refresh_calls(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn exchange_calls(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }
}

fn token_response(access_token: &str, refresh_token: Option<&str>) -> TokenResponse {
    serde_json::from_value(serde_json::json!({
        "access_token": access_token,
        "refresh_token": refresh_token,
        "expires_in": 3600,
        "token_type": "Bearer"
    }))
    .unwrap()
}

#[async_trait]
impl TokenEndpoint for FakeProvider {
    async fn exchange_code(
        &self,
        code: &str,
        _redirect_uri: &str,
        _pkce_verifier: &str,
    ) -> Result<TokenResponse, EndpointError> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        if code == "bad-code" {
            return Err(EndpointError::Rejected("invalid_grant (400)".to_string()));
        }
        Ok(token_response(&format!("access-{}", code), Some("refresh-1")))
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenResponse, EndpointError> {
        let call = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }

        let mode = *self.refresh_mode.lock().unwrap();
        match mode {
            RefreshMode::Succeed => Ok(token_response(&format!("refreshed-{}", call), None)),
            RefreshMode::Reject => Err(EndpointError::Rejected(
                "invalid_grant (400): Token has been expired or revoked.".to_string(),
            )),
            RefreshMode::Unavailable => Err(EndpointError::Transient("HTTP 503".to_string())),
        }
    }

    async fn revoke(&self, token: &str) -> Result<(), EndpointError> {
        self.revocations.lock().unwrap().push(token.to_string());
        if self.revoke_fails {
            return Err(EndpointError::Transient("revoke request failed".to_string()));
        }
        Ok(())
    }
}

pub fn provider_config(redirect_uri: &str) -> ProviderConfig {
    ProviderConfig {
        auth_url: "https://accounts.example.com/o/oauth2/auth".to_string(),
        token_url: "https://accounts.example.com/token".to_string(),
        revoke_url: Some("https://accounts.example.com/revoke".to_string()),
        scopes: vec!["https://www.googleapis.com/auth/gmail.modify".to_string()],
        client_id: "test-client".to_string(),
        client_secret: None,
        redirect_uri: redirect_uri.to_string(),
        extra_auth_params: vec![("access_type".to_string(), "offline".to_string())],
    }
}

/// Credential expiring `expires_in_secs` from now (negative: already expired)
pub fn credential(identity: &str, expires_in_secs: i64, refresh_token: Option<&str>) -> Credential {
    let now = Utc::now();
    Credential {
        identity: identity.to_string(),
        access_token: format!("access-{}", identity),
        refresh_token: refresh_token.map(String::from),
        expiry: now + Duration::seconds(expires_in_secs),
        scopes: BTreeSet::from(["https://www.googleapis.com/auth/gmail.modify".to_string()]),
        issued_at: now - Duration::hours(1),
    }
}

pub struct TestHarness {
    pub dir: TempDir,
    pub store: Arc<EncryptedTokenStore>,
    pub provider: Arc<FakeProvider>,
    pub manager: CredentialManager,
}

pub fn harness(provider: FakeProvider) -> TestHarness {
    harness_with(provider, ListenerSettings::default(), 600)
}

pub fn harness_with(
    provider: FakeProvider,
    listener: ListenerSettings,
    state_ttl_secs: i64,
) -> TestHarness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(EncryptedTokenStore::open(dir.path(), "test-master-secret", fast_kdf()).unwrap());
    let provider = Arc::new(provider);

    let redirect_uri = format!("http://{}{}", listener.addr, listener.path);
    let settings = ManagerSettings {
        cache: CacheSettings {
            safety_margin: Duration::seconds(300),
            retry_backoff: std::time::Duration::from_millis(10),
        },
        state_ttl_secs,
        listener,
    };

    let manager = CredentialManager::new(
        provider_config(&redirect_uri),
        provider.clone(),
        store.clone(),
        settings,
    );

    TestHarness {
        dir,
        store,
        provider,
        manager,
    }
}

/// A localhost address with a port that was free a moment ago
pub fn free_local_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Value of `name` in a URL query string
pub fn query_param(url: &str, name: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| urlencoding::decode(value).ok().map(|v| v.into_owned()))?
    })
}
