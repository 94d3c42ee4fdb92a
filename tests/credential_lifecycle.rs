// Integration tests for the credential lifecycle: refresh, authorization, revocation

mod common;

use common::{credential, harness, harness_with, query_param, FakeProvider, RefreshMode};
use chrono::Utc;
use credvault::credentials::EncryptedTokenStore;
use credvault::manager::ListenerSettings;
use credvault::oauth::FlowState;
use credvault::{AuthStatus, CredentialError, RefreshFailure};
use std::time::Duration;

/// Expired credential with a valid refresh token is refreshed transparently.
#[tokio::test]
async fn test_expired_credential_refreshed_on_get_client() {
    let h = harness(FakeProvider::new());
    h.store
        .save("a", &credential("a", -1, Some("refresh-a")))
        .unwrap();

    let client = h.manager.get_client("a").await.unwrap();
    assert_eq!(client.access_token(), "refreshed-1");

    let stored = h.store.load("a").unwrap();
    assert!(stored.expiry > Utc::now());
    assert_eq!(stored.access_token, "refreshed-1");
    // Provider did not rotate the refresh token, the old one is kept
    assert_eq!(stored.refresh_token.as_deref(), Some("refresh-a"));
    assert_eq!(h.manager.status("a").unwrap(), AuthStatus::Authorized);
}

/// Unknown identity: unauthenticated, then a forged state is refused.
#[tokio::test]
async fn test_unknown_identity_and_forged_state() {
    let h = harness(FakeProvider::new());

    let result = h.manager.get_client("b").await;
    assert!(matches!(result, Err(CredentialError::Unauthenticated)));

    let first_url = h.manager.begin_authorization("b");
    let first_state = query_param(&first_url, "state").unwrap();
    let url = h.manager.begin_authorization("b");
    let state = query_param(&url, "state").unwrap();
    assert_ne!(first_state, state);
    assert!(state.len() >= 43);

    let result = h
        .manager
        .complete_authorization("b", "code-1", "wrong-state")
        .await;
    assert!(matches!(result, Err(CredentialError::StateMismatch)));

    assert_eq!(h.manager.status("b").unwrap(), AuthStatus::Unauthenticated);
    assert!(matches!(
        h.store.load("b"),
        Err(CredentialError::NotFound)
    ));
    assert_eq!(h.provider.exchange_calls(), 0);
}

/// Provider rejects the refresh token: credential gone, status unauthenticated.
#[tokio::test]
async fn test_rejected_refresh_token_discards_credential() {
    let provider = FakeProvider::new();
    provider.set_refresh_mode(RefreshMode::Reject);
    let h = harness(provider);
    h.store
        .save("c", &credential("c", -60, Some("revoked-refresh")))
        .unwrap();

    let result = h.manager.get_client("c").await;
    match result {
        Err(e @ CredentialError::RefreshFailed(RefreshFailure::Rejected(_))) => {
            assert!(e.requires_reauthorization());
        }
        other => panic!("expected rejected refresh, got {:?}", other.map(|_| ())),
    }

    assert_eq!(h.manager.status("c").unwrap(), AuthStatus::Unauthenticated);
    assert!(matches!(h.store.load("c"), Err(CredentialError::NotFound)));
}

/// Concurrent callers on an expiring credential share one provider refresh.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_get_client_refreshes_once() {
    let h = harness(FakeProvider::new().with_refresh_delay(Duration::from_millis(100)));
    h.store
        .save("shared", &credential("shared", 30, Some("refresh-shared")))
        .unwrap();

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let manager = h.manager.clone();
            tokio::spawn(async move { manager.get_client("shared").await })
        })
        .collect();

    let results = futures::future::join_all(tasks).await;
    for result in results {
        let client = result.unwrap().unwrap();
        assert_eq!(client.access_token(), "refreshed-1");
    }

    assert_eq!(h.provider.refresh_calls(), 1);
}

/// A completed flow stores the credential; replaying the callback fails.
#[tokio::test]
async fn test_complete_authorization_then_replay() {
    let h = harness(FakeProvider::new());

    let url = h.manager.begin_authorization("d");
    assert_eq!(h.manager.flow_state("d"), FlowState::PendingAuthorization);
    let state = query_param(&url, "state").unwrap();
    assert!(query_param(&url, "code_challenge").is_some());
    assert_eq!(query_param(&url, "code_challenge_method").as_deref(), Some("S256"));

    let client = h
        .manager
        .complete_authorization("d", "code-1", &state)
        .await
        .unwrap();
    assert_eq!(client.access_token(), "access-code-1");
    assert_eq!(h.store.load("d").unwrap().access_token, "access-code-1");
    assert_eq!(h.manager.flow_state("d"), FlowState::Idle);

    let replay = h.manager.complete_authorization("d", "code-1", &state).await;
    assert!(matches!(replay, Err(CredentialError::StateMismatch)));
    assert_eq!(h.provider.exchange_calls(), 1);

    // Served from cache without another exchange or refresh
    let again = h.manager.get_client("d").await.unwrap();
    assert_eq!(again.access_token(), "access-code-1");
    assert_eq!(h.provider.refresh_calls(), 0);
}

/// A request past its TTL is refused even with the right state.
#[tokio::test]
async fn test_expired_authorization_request() {
    let h = harness_with(FakeProvider::new(), ListenerSettings::default(), 0);

    let url = h.manager.begin_authorization("e");
    let state = query_param(&url, "state").unwrap();

    let result = h.manager.complete_authorization("e", "code-1", &state).await;
    assert!(matches!(result, Err(CredentialError::StateExpired)));
    assert_eq!(h.provider.exchange_calls(), 0);
    assert!(matches!(h.store.load("e"), Err(CredentialError::NotFound)));
}

/// Failed code exchange writes nothing.
#[tokio::test]
async fn test_failed_exchange_writes_nothing() {
    let h = harness(FakeProvider::new());

    let url = h.manager.begin_authorization("f");
    let state = query_param(&url, "state").unwrap();

    let result = h.manager.complete_authorization("f", "bad-code", &state).await;
    assert!(matches!(result, Err(CredentialError::ExchangeFailed(_))));
    assert!(h.manager.identities().unwrap().is_empty());
    assert_eq!(h.manager.flow_state("f"), FlowState::Idle);
}

/// Transient refresh failure keeps the credential and is retryable.
#[tokio::test]
async fn test_transient_refresh_failure_keeps_credential() {
    let provider = FakeProvider::new();
    provider.set_refresh_mode(RefreshMode::Unavailable);
    let h = harness(provider);
    h.store
        .save("g", &credential("g", -5, Some("refresh-g")))
        .unwrap();

    let result = h.manager.get_client("g").await;
    match result {
        Err(e @ CredentialError::RefreshFailed(RefreshFailure::Transient(_))) => {
            assert!(!e.requires_reauthorization());
        }
        other => panic!("expected transient failure, got {:?}", other.map(|_| ())),
    }
    // One call plus one retry
    assert_eq!(h.provider.refresh_calls(), 2);
    assert_eq!(h.manager.status("g").unwrap(), AuthStatus::Expired);

    h.provider.set_refresh_mode(RefreshMode::Succeed);
    let client = h.manager.get_client("g").await.unwrap();
    assert_eq!(client.access_token(), "refreshed-3");
}

/// Status reflects stored state without calling the provider.
#[tokio::test]
async fn test_status_reporting() {
    let h = harness(FakeProvider::new());
    h.store
        .save("fresh", &credential("fresh", 3600, Some("r")))
        .unwrap();
    h.store
        .save("stale", &credential("stale", 60, Some("r")))
        .unwrap();
    h.store
        .save("dead", &credential("dead", -60, None))
        .unwrap();

    assert_eq!(h.manager.status("fresh").unwrap(), AuthStatus::Authorized);
    assert_eq!(h.manager.status("stale").unwrap(), AuthStatus::Expired);
    assert_eq!(h.manager.status("dead").unwrap(), AuthStatus::Unauthenticated);
    assert_eq!(h.manager.status("nobody").unwrap(), AuthStatus::Unauthenticated);
    assert_eq!(h.provider.refresh_calls(), 0);

    let mut identities = h.manager.identities().unwrap();
    identities.sort();
    assert_eq!(identities, vec!["dead", "fresh", "stale"]);
}

/// Terminal credential never triggers a refresh attempt.
#[tokio::test]
async fn test_terminal_credential_requires_new_flow() {
    let h = harness(FakeProvider::new());
    h.store
        .save("dead", &credential("dead", -60, None))
        .unwrap();

    let result = h.manager.get_client("dead").await;
    assert!(matches!(result, Err(CredentialError::Unauthenticated)));
    assert_eq!(h.provider.refresh_calls(), 0);
}

/// Store opened with another master secret cannot read existing blobs.
#[tokio::test]
async fn test_wrong_master_secret_fails_closed() {
    let h = harness(FakeProvider::new());
    h.store
        .save("a", &credential("a", 3600, Some("r")))
        .unwrap();

    let other = EncryptedTokenStore::open(h.dir.path(), "another-secret", common::fast_kdf()).unwrap();
    assert!(matches!(other.load("a"), Err(CredentialError::DecryptionFailed)));
}

/// Revoke sends the refresh token to the provider and deletes locally.
#[tokio::test]
async fn test_revoke_remote_and_local() {
    let h = harness(FakeProvider::new());
    h.store
        .save("a", &credential("a", 3600, Some("refresh-a")))
        .unwrap();
    h.manager.get_client("a").await.unwrap();

    assert!(h.manager.revoke("a").await.unwrap());
    assert_eq!(*h.provider.revocations.lock().unwrap(), vec!["refresh-a".to_string()]);
    assert!(matches!(h.store.load("a"), Err(CredentialError::NotFound)));
    assert!(h.manager.cache().peek("a").is_none());
    assert!(matches!(
        h.manager.get_client("a").await,
        Err(CredentialError::Unauthenticated)
    ));

    // Nothing left to revoke
    assert!(!h.manager.revoke("a").await.unwrap());
}

/// Remote revoke failure still removes the local credential.
#[tokio::test]
async fn test_revoke_deletes_locally_when_remote_fails() {
    let h = harness(FakeProvider::new().with_failing_revoke());
    h.store
        .save("a", &credential("a", 3600, None))
        .unwrap();

    assert!(h.manager.revoke("a").await.unwrap());
    assert_eq!(*h.provider.revocations.lock().unwrap(), vec!["access-a".to_string()]);
    assert_eq!(h.manager.status("a").unwrap(), AuthStatus::Unauthenticated);
}

/// A token endpoint answering 404 is a provider outage, not a dead grant.
#[tokio::test]
async fn test_misrouted_token_endpoint_keeps_credential() {
    use credvault::cache::CacheSettings;
    use credvault::manager::{CredentialManager, ManagerSettings};
    use credvault::oauth::HttpTokenEndpoint;
    use std::sync::Arc;

    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/token")
        .with_status(404)
        .with_body("Not Found")
        .expect(2)
        .create_async()
        .await;

    let mut provider = common::provider_config("http://127.0.0.1:8000/auth/callback");
    provider.token_url = format!("{}/token", server.url());

    let dir = tempfile::TempDir::new().unwrap();
    let store = Arc::new(EncryptedTokenStore::open(dir.path(), "test-master-secret", common::fast_kdf()).unwrap());
    store
        .save("h", &credential("h", -30, Some("refresh-h")))
        .unwrap();

    let settings = ManagerSettings {
        cache: CacheSettings {
            safety_margin: chrono::Duration::seconds(300),
            retry_backoff: Duration::from_millis(10),
        },
        state_ttl_secs: 600,
        listener: ListenerSettings::default(),
    };
    let endpoint = Arc::new(HttpTokenEndpoint::new(&provider));
    let manager = CredentialManager::new(provider, endpoint, store.clone(), settings);

    let result = manager.get_client("h").await;
    assert!(matches!(
        result,
        Err(CredentialError::RefreshFailed(RefreshFailure::Transient(_)))
    ));
    assert_eq!(store.load("h").unwrap().refresh_token.as_deref(), Some("refresh-h"));
    assert_eq!(manager.status("h").unwrap(), AuthStatus::Expired);
    mock.assert_async().await;
}
