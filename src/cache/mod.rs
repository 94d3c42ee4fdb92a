//! In-memory credential cache handing out authenticated clients.
//!
//! Reads are lock-free on the hot path: a fresh entry is cloned out of the
//! map and returned. Stale or missing entries go through the
//! [`RefreshCoordinator`], which is the only writer besides flow completion.

mod refresh;

pub use refresh::RefreshCoordinator;

use crate::credentials::{Credential, EncryptedTokenStore};
use crate::error::{CredentialError, Result};
use crate::oauth::TokenEndpoint;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Refresh timing knobs
#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    /// A credential this close to expiry is refreshed before use
    pub safety_margin: Duration,
    /// Wait before the single retry of a transient refresh failure
    pub retry_backoff: std::time::Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            safety_margin: Duration::seconds(300),
            retry_backoff: std::time::Duration::from_millis(500),
        }
    }
}

/// A credential bound to an HTTP client, ready for API calls.
///
/// Cheap to clone. The credential inside never changes; a refresh produces a
/// new client.
#[derive(Clone)]
pub struct AuthenticatedClient {
    credential: Arc<Credential>,
    http: reqwest::Client,
}

impl AuthenticatedClient {
    pub fn new(credential: Credential, http: reqwest::Client) -> Self {
        Self {
            credential: Arc::new(credential),
            http,
        }
    }

    pub fn identity(&self) -> &str {
        &self.credential.identity
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn access_token(&self) -> &str {
        &self.credential.access_token
    }

    pub fn expiry(&self) -> DateTime<Utc> {
        self.credential.expiry
    }

    pub fn scopes(&self) -> &BTreeSet<String> {
        &self.credential.scopes
    }

    /// Request builder with the bearer token already attached
    pub fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.credential.access_token)
    }

    pub fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.request(reqwest::Method::GET, url)
    }

    pub fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.request(reqwest::Method::POST, url)
    }
}

impl fmt::Debug for AuthenticatedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatedClient")
            .field("credential", &self.credential)
            .finish_non_exhaustive()
    }
}

/// Per-identity cache of authenticated clients
#[derive(Clone)]
pub struct CredentialCache {
    entries: Arc<DashMap<String, AuthenticatedClient>>,
    store: Arc<EncryptedTokenStore>,
    refresher: RefreshCoordinator,
    http: reqwest::Client,
    safety_margin: Duration,
}

impl CredentialCache {
    pub fn new(
        store: Arc<EncryptedTokenStore>,
        endpoint: Arc<dyn TokenEndpoint>,
        settings: CacheSettings,
    ) -> Self {
        let entries = Arc::new(DashMap::new());
        let http = reqwest::Client::new();
        let refresher = RefreshCoordinator::new(
            store.clone(),
            endpoint,
            entries.clone(),
            http.clone(),
            settings,
        );

        Self {
            entries,
            store,
            refresher,
            http,
            safety_margin: settings.safety_margin,
        }
    }

    /// Returns a client whose token is valid for at least the safety margin.
    ///
    /// Blocks on a refresh when the credential is stale. Fails with
    /// `Unauthenticated` when nothing is stored or the stale credential
    /// cannot be refreshed.
    pub async fn get_client(&self, identity: &str) -> Result<AuthenticatedClient> {
        let now = Utc::now();

        let cached = self.entries.get(identity).map(|entry| entry.value().clone());
        let credential = match cached {
            Some(client) if !client.credential().needs_refresh(now, self.safety_margin) => {
                return Ok(client);
            }
            Some(client) => client.credential().clone(),
            None => match self.store.load(identity) {
                Ok(credential) => credential,
                Err(CredentialError::NotFound) => {
                    debug!(identity = %identity, "No stored credential");
                    return Err(CredentialError::Unauthenticated);
                }
                Err(e) => return Err(e),
            },
        };

        if !credential.needs_refresh(now, self.safety_margin) {
            debug!(identity = %identity, "Loaded credential from store");
            let client = AuthenticatedClient::new(credential, self.http.clone());
            // A concurrent refresh may have installed a newer entry meanwhile
            return Ok(self
                .entries
                .entry(identity.to_string())
                .or_insert(client)
                .value()
                .clone());
        }

        if !credential.can_refresh() {
            debug!(identity = %identity, "Credential is stale and cannot be refreshed");
            return Err(CredentialError::Unauthenticated);
        }

        self.refresher.refresh_client(identity, &credential).await
    }

    /// The cached credential, without touching the store or the provider
    pub fn peek(&self, identity: &str) -> Option<Credential> {
        self.entries
            .get(identity)
            .map(|entry| entry.credential().clone())
    }

    pub fn refresher(&self) -> &RefreshCoordinator {
        &self.refresher
    }

    pub fn safety_margin(&self) -> Duration {
        self.safety_margin
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
