//! The credential manager: the interface the rest of the system talks to.
//!
//! Wires the token store, the authorization flow, the callback listener and
//! the cache together. Consumers only ever ask for an
//! [`AuthenticatedClient`]; everything else here exists to produce one.

use crate::cache::{AuthenticatedClient, CacheSettings, CredentialCache};
use crate::config::CredvaultConfig;
use crate::credentials::{Credential, EncryptedTokenStore};
use crate::error::{CredentialError, Result};
use crate::oauth::{
    run_state_cleanup, AuthorizationFlowController, CallbackListener, FlowState, HttpTokenEndpoint,
    ProviderConfig, TokenEndpoint,
};
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Authentication status of one identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthStatus {
    /// No usable credential; an authorization flow is required
    Unauthenticated,
    /// Credential valid beyond the safety margin
    Authorized,
    /// Credential stale but refreshable
    Expired,
}

impl AuthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthStatus::Unauthenticated => "unauthenticated",
            AuthStatus::Authorized => "authorized",
            AuthStatus::Expired => "expired",
        }
    }

    /// Human-readable next step
    pub fn message(&self) -> &'static str {
        match self {
            AuthStatus::Unauthenticated => {
                "Not authenticated. Run the login flow to authorize this identity."
            }
            AuthStatus::Authorized => "Authenticated.",
            AuthStatus::Expired => {
                "Access token expired; it will be refreshed on next use."
            }
        }
    }
}

impl fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the callback listener binds and how long it waits
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub addr: SocketAddr,
    pub path: String,
    pub timeout: Duration,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 8000)),
            path: "/auth/callback".to_string(),
            timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub cache: CacheSettings,
    pub state_ttl_secs: i64,
    pub listener: ListenerSettings,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            cache: CacheSettings::default(),
            state_ttl_secs: 600,
            listener: ListenerSettings::default(),
        }
    }
}

/// Credential lifecycle facade
#[derive(Clone)]
pub struct CredentialManager {
    store: Arc<EncryptedTokenStore>,
    endpoint: Arc<dyn TokenEndpoint>,
    flow: AuthorizationFlowController,
    cache: CredentialCache,
    listener: ListenerSettings,
}

impl CredentialManager {
    pub fn new(
        provider: ProviderConfig,
        endpoint: Arc<dyn TokenEndpoint>,
        store: Arc<EncryptedTokenStore>,
        settings: ManagerSettings,
    ) -> Self {
        let flow = AuthorizationFlowController::new(provider, endpoint.clone(), settings.state_ttl_secs);
        let cache = CredentialCache::new(store.clone(), endpoint.clone(), settings.cache);

        Self {
            store,
            endpoint,
            flow,
            cache,
            listener: settings.listener,
        }
    }

    /// Builds a manager talking to the configured provider over HTTPS.
    ///
    /// Opens (or creates) the token store, which derives the storage key.
    pub fn from_config(config: &CredvaultConfig) -> Result<Self> {
        config.validate()?;
        let provider = config.provider_config()?;
        let (callback_addr, callback_path) = config.callback_endpoint()?;
        let token_dir = config.token_dir()?;
        let store = EncryptedTokenStore::open(&token_dir, config.master_secret()?, config.kdf_params())?;

        info!(
            token_dir = %token_dir.display(),
            redirect_uri = %provider.redirect_uri,
            scopes = ?provider.scopes,
            "Credential manager initialized"
        );

        let endpoint = Arc::new(HttpTokenEndpoint::new(&provider));
        let settings = ManagerSettings {
            cache: config.cache_settings(),
            state_ttl_secs: config.callback.state_ttl_seconds,
            listener: ListenerSettings {
                addr: callback_addr,
                path: callback_path,
                timeout: Duration::from_secs(config.callback.timeout_seconds),
            },
        };

        Ok(Self::new(provider, endpoint, Arc::new(store), settings))
    }

    /// Authenticated client for `identity`, refreshing first when needed.
    pub async fn get_client(&self, identity: &str) -> Result<AuthenticatedClient> {
        self.cache.get_client(identity).await
    }

    /// Starts an authorization flow and returns the URL for the user.
    pub fn begin_authorization(&self, identity: &str) -> String {
        let (url, _request) = self.flow.begin(identity);
        url
    }

    /// Finishes a flow started with [`begin_authorization`](Self::begin_authorization)
    /// and stores the resulting credential.
    pub async fn complete_authorization(
        &self,
        identity: &str,
        code: &str,
        state: &str,
    ) -> Result<AuthenticatedClient> {
        let credential = self.flow.complete(identity, code, state).await?;
        self.cache.refresher().install(credential).await
    }

    /// Interactive flow: opens the system browser on the authorization URL.
    pub async fn authenticate(&self, identity: &str) -> Result<AuthenticatedClient> {
        self.authenticate_with(identity, launch_browser).await
    }

    /// Interactive flow with a caller-supplied way of presenting the URL.
    ///
    /// Binds the callback listener before `on_url` runs, waits for the
    /// redirect and completes the flow. A flow that times out or is denied
    /// leaves the identity idle.
    pub async fn authenticate_with<F>(&self, identity: &str, on_url: F) -> Result<AuthenticatedClient>
    where
        F: FnOnce(&str),
    {
        let listener = CallbackListener::bind(self.listener.addr, &self.listener.path).await?;
        let url = self.begin_authorization(identity);
        on_url(&url);

        let params = match listener.wait(self.listener.timeout).await {
            Ok(params) => params,
            Err(e) => {
                self.flow.state_manager().take(identity);
                return Err(e);
            }
        };

        self.complete_authorization(identity, &params.code, &params.state)
            .await
    }

    /// Startup check: returns a client when the identity is usable, otherwise
    /// runs the interactive flow up to `max_attempts` times.
    pub async fn ensure_authenticated(
        &self,
        identity: &str,
        max_attempts: u32,
    ) -> Result<AuthenticatedClient> {
        self.ensure_authenticated_with(identity, max_attempts, launch_browser)
            .await
    }

    pub async fn ensure_authenticated_with<F>(
        &self,
        identity: &str,
        max_attempts: u32,
        on_url: F,
    ) -> Result<AuthenticatedClient>
    where
        F: Fn(&str),
    {
        match self.get_client(identity).await {
            Ok(client) => return Ok(client),
            Err(e) if e.requires_reauthorization() => {
                info!(identity = %identity, reason = %e, "Authorization required");
            }
            Err(e) => return Err(e),
        }

        let attempts = max_attempts.max(1);
        let mut last_error = CredentialError::Unauthenticated;

        for attempt in 1..=attempts {
            info!(identity = %identity, attempt, attempts, "Starting authorization flow");

            match self.authenticate_with(identity, &on_url).await {
                Ok(client) => return Ok(client),
                Err(e @ CredentialError::Config(_)) => return Err(e),
                Err(e) => {
                    warn!(identity = %identity, attempt, error = %e, "Authorization attempt failed");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    /// Revokes the credential at the provider (best effort) and deletes it
    /// locally. Returns whether a credential existed.
    pub async fn revoke(&self, identity: &str) -> Result<bool> {
        let credential = match self.current(identity) {
            Ok(credential) => Some(credential),
            Err(CredentialError::NotFound) => None,
            Err(e) => {
                warn!(identity = %identity, error = %e, "Stored credential unreadable, deleting without remote revoke");
                None
            }
        };

        if let Some(credential) = &credential {
            let token = credential
                .refresh_token
                .as_deref()
                .unwrap_or(&credential.access_token);

            match self.endpoint.revoke(token).await {
                Ok(()) => debug!(identity = %identity, "Token revoked at provider"),
                Err(e) => warn!(identity = %identity, error = %e, "Remote revoke failed, deleting locally"),
            }
        }

        self.cache.refresher().discard(identity).await?;
        info!(identity = %identity, had_credential = credential.is_some(), "Credential revoked");

        Ok(credential.is_some())
    }

    /// Status of `identity`, without calling the provider.
    ///
    /// Unreadable stored credentials fail with `DecryptionFailed` rather
    /// than reporting `Unauthenticated`.
    pub fn status(&self, identity: &str) -> Result<AuthStatus> {
        let credential = match self.current(identity) {
            Ok(credential) => credential,
            Err(CredentialError::NotFound) => return Ok(AuthStatus::Unauthenticated),
            Err(e) => return Err(e),
        };

        let status = if !credential.needs_refresh(Utc::now(), self.cache.safety_margin()) {
            AuthStatus::Authorized
        } else if credential.can_refresh() {
            AuthStatus::Expired
        } else {
            AuthStatus::Unauthenticated
        };
        Ok(status)
    }

    pub fn flow_state(&self, identity: &str) -> FlowState {
        self.flow.flow_state(identity)
    }

    /// Identities with a stored credential
    pub fn identities(&self) -> Result<Vec<String>> {
        self.store.list()
    }

    /// Spawns the periodic purge of expired authorization requests.
    pub fn spawn_state_cleanup(&self, interval_seconds: u64) -> JoinHandle<()> {
        let states = self.flow.state_manager().clone();
        tokio::spawn(run_state_cleanup(states, interval_seconds))
    }

    pub fn cache(&self) -> &CredentialCache {
        &self.cache
    }

    pub fn store(&self) -> &EncryptedTokenStore {
        &self.store
    }

    fn current(&self, identity: &str) -> Result<Credential> {
        match self.cache.peek(identity) {
            Some(credential) => Ok(credential),
            None => self.store.load(identity),
        }
    }
}

fn launch_browser(url: &str) {
    match open::that(url) {
        Ok(()) => info!("Opened browser for authorization"),
        Err(e) => {
            warn!(error = %e, "Failed to open browser");
            eprintln!("Open this URL in your browser to continue:\n\n  {}\n", url);
        }
    }
}
