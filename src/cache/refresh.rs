//! Single-flight token refresh.
//!
//! Each identity gets its own async mutex. Whoever holds it re-reads the
//! current credential before calling the provider, so callers that queued up
//! behind an in-flight refresh get the result instead of refreshing again.

use super::{AuthenticatedClient, CacheSettings};
use crate::credentials::{Credential, EncryptedTokenStore};
use crate::error::{CredentialError, RefreshFailure, Result};
use crate::oauth::{EndpointError, TokenEndpoint, TokenResponse};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Serializes refreshes per identity and writes their results through the
/// store into the cache.
#[derive(Clone)]
pub struct RefreshCoordinator {
    store: Arc<EncryptedTokenStore>,
    endpoint: Arc<dyn TokenEndpoint>,
    entries: Arc<DashMap<String, AuthenticatedClient>>,
    guards: Arc<DashMap<String, Arc<Mutex<()>>>>,
    http: reqwest::Client,
    settings: CacheSettings,
}

impl RefreshCoordinator {
    pub(crate) fn new(
        store: Arc<EncryptedTokenStore>,
        endpoint: Arc<dyn TokenEndpoint>,
        entries: Arc<DashMap<String, AuthenticatedClient>>,
        http: reqwest::Client,
        settings: CacheSettings,
    ) -> Self {
        Self {
            store,
            endpoint,
            entries,
            guards: Arc::new(DashMap::new()),
            http,
            settings,
        }
    }

    /// Refreshes `identity` unless its credential is already fresh.
    ///
    /// Fails with `Unauthenticated` when there is no credential or no refresh
    /// token, and with `RefreshFailed` when the provider call fails. A
    /// rejected refresh token removes the credential from store and cache.
    pub async fn refresh(&self, identity: &str) -> Result<Credential> {
        let observed = self.current(identity)?;
        let client = self.refresh_client(identity, &observed).await?;
        Ok(client.credential().clone())
    }

    /// Refreshes the credential the caller saw as stale.
    ///
    /// When the current credential no longer matches `observed`, another
    /// caller already refreshed it while this one waited on the guard.
    pub(crate) async fn refresh_client(
        &self,
        identity: &str,
        observed: &Credential,
    ) -> Result<AuthenticatedClient> {
        let guard = self.guard(identity);
        let _held = guard.lock().await;

        let now = Utc::now();
        let current = self.current(identity)?;
        let replaced = current.access_token != observed.access_token && !current.is_expired(now);
        if replaced || !current.needs_refresh(now, self.settings.safety_margin) {
            debug!(identity = %identity, "Credential already fresh, skipping provider call");
            return Ok(self
                .entries
                .entry(identity.to_string())
                .or_insert_with(|| self.client_for(current))
                .value()
                .clone());
        }

        let Some(refresh_token) = current.refresh_token.clone() else {
            debug!(identity = %identity, "Credential is stale and has no refresh token");
            return Err(CredentialError::Unauthenticated);
        };

        info!(identity = %identity, expiry = %current.expiry, "Refreshing access token");

        let outcome = self
            .call_provider(identity, &refresh_token)
            .await
            .and_then(|response| response.into_credential(identity, Some(&current), Utc::now()));

        match outcome {
            Ok(refreshed) => {
                // The provider may have rotated the refresh token, so the new
                // credential stays cached even when the write fails.
                if let Err(e) = self.persist(identity, &refreshed).await {
                    warn!(
                        identity = %identity,
                        error = %e,
                        "Refreshed credential not persisted, serving it from memory"
                    );
                }

                let client = self.client_for(refreshed);
                self.entries.insert(identity.to_string(), client.clone());

                info!(
                    identity = %identity,
                    expiry = %client.expiry(),
                    "Access token refreshed"
                );
                Ok(client)
            }
            Err(EndpointError::Rejected(reason)) => {
                warn!(
                    identity = %identity,
                    reason = %reason,
                    "Refresh token rejected, discarding credential"
                );
                self.entries.remove(identity);
                if let Err(e) = self.store.delete(identity) {
                    warn!(identity = %identity, error = %e, "Failed to delete rejected credential");
                }
                Err(CredentialError::RefreshFailed(RefreshFailure::Rejected(reason)))
            }
            Err(EndpointError::Transient(reason)) => {
                warn!(identity = %identity, reason = %reason, "Token refresh failed, keeping credential");
                Err(CredentialError::RefreshFailed(RefreshFailure::Transient(reason)))
            }
        }
    }

    /// Persists a credential from a completed authorization flow and makes it
    /// the cached one.
    pub(crate) async fn install(&self, credential: Credential) -> Result<AuthenticatedClient> {
        let identity = credential.identity.clone();
        let guard = self.guard(&identity);
        let _held = guard.lock().await;

        self.store.save(&identity, &credential)?;
        let client = self.client_for(credential);
        self.entries.insert(identity, client.clone());
        Ok(client)
    }

    /// Removes the credential for `identity` from store and cache.
    pub(crate) async fn discard(&self, identity: &str) -> Result<()> {
        let guard = self.guard(identity);
        let _held = guard.lock().await;

        self.entries.remove(identity);
        self.store.delete(identity)
    }

    fn guard(&self, identity: &str) -> Arc<Mutex<()>> {
        self.guards
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Cached credential, or the stored one on a miss.
    fn current(&self, identity: &str) -> Result<Credential> {
        if let Some(entry) = self.entries.get(identity) {
            return Ok(entry.credential().clone());
        }
        match self.store.load(identity) {
            Ok(credential) => Ok(credential),
            Err(CredentialError::NotFound) => Err(CredentialError::Unauthenticated),
            Err(e) => Err(e),
        }
    }

    /// One provider call, retried once after the backoff on a transient failure.
    async fn call_provider(
        &self,
        identity: &str,
        refresh_token: &str,
    ) -> std::result::Result<TokenResponse, EndpointError> {
        match self.endpoint.refresh(refresh_token).await {
            Err(EndpointError::Transient(reason)) => {
                debug!(
                    identity = %identity,
                    reason = %reason,
                    backoff_ms = self.settings.retry_backoff.as_millis() as u64,
                    "Transient refresh failure, retrying once"
                );
                tokio::time::sleep(self.settings.retry_backoff).await;
                self.endpoint.refresh(refresh_token).await
            }
            other => other,
        }
    }

    /// Saves with the same single retry as the provider call.
    async fn persist(&self, identity: &str, credential: &Credential) -> Result<()> {
        match self.store.save(identity, credential) {
            Err(CredentialError::Storage(reason)) => {
                debug!(identity = %identity, reason = %reason, "Storage write failed, retrying once");
                tokio::time::sleep(self.settings.retry_backoff).await;
                self.store.save(identity, credential)
            }
            other => other,
        }
    }

    fn client_for(&self, credential: Credential) -> AuthenticatedClient {
        AuthenticatedClient::new(credential, self.http.clone())
    }
}
