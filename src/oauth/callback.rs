//! Single-use local HTTP endpoint for the provider's redirect.
//!
//! The listener binds one localhost port for one pending flow. The first
//! request carrying `code` + `state` (or a provider `error`) resolves the
//! wait, after which the server shuts down and the port is released. Requests
//! carrying neither get `400` and are otherwise ignored.

use crate::error::{CredentialError, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// How long to wait for open browser connections to drain after the callback
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const SUCCESS_PAGE: &str = "<!DOCTYPE html><html><head><title>Authorization complete</title></head>\
<body><h1>Authorization received</h1><p>You can close this window and return to the application.</p></body></html>";

const FAILURE_PAGE: &str = "<!DOCTYPE html><html><head><title>Authorization failed</title></head>\
<body><h1>Authorization was not granted</h1><p>Return to the application and start the sign-in again.</p></body></html>";

/// Query parameters delivered by the provider's redirect
#[derive(Clone, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: String,
    pub state: String,
}

impl std::fmt::Debug for CallbackParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackParams").finish_non_exhaustive()
    }
}

/// OAuth callback query parameters
#[derive(Deserialize)]
pub(crate) struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

type ResultSender = Arc<Mutex<Option<oneshot::Sender<Result<CallbackParams>>>>>;

/// A bound, not yet serving, callback listener.
///
/// Binding is separate from waiting so the port is held before the browser
/// is sent to the provider.
pub struct CallbackListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    path: String,
}

impl CallbackListener {
    /// Binds `addr`; the redirect is expected on `path` (and `/`).
    pub async fn bind(addr: SocketAddr, path: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            CredentialError::Listen(format!(
                "failed to bind callback listener on {}: {}",
                addr, e
            ))
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| CredentialError::Listen(e.to_string()))?;

        debug!(addr = %local_addr, path = %path, "Callback listener bound");

        Ok(Self {
            listener,
            local_addr,
            path: normalize_path(path),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves until the first well-formed callback or until `timeout`.
    ///
    /// The listener is consumed: whatever the outcome, the port is released
    /// before this returns.
    pub async fn wait(self, timeout: Duration) -> Result<CallbackParams> {
        let Self {
            listener,
            local_addr,
            path,
        } = self;

        let (result_tx, result_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = callback_router(&path, Arc::new(Mutex::new(Some(result_tx))));

        let mut server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        let outcome = tokio::time::timeout(timeout, result_rx).await;

        let _ = shutdown_tx.send(());
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await.is_err() {
            warn!("Callback listener did not drain in time, aborting");
            server.abort();
        }

        match outcome {
            Ok(Ok(result)) => {
                if result.is_ok() {
                    info!(addr = %local_addr, "Authorization callback received");
                }
                result
            }
            Ok(Err(_)) => Err(CredentialError::Listen(
                "callback listener stopped unexpectedly".to_string(),
            )),
            Err(_) => {
                info!(
                    addr = %local_addr,
                    timeout_secs = timeout.as_secs(),
                    "Timed out waiting for authorization callback"
                );
                Err(CredentialError::Timeout)
            }
        }
    }
}

/// Binds `127.0.0.1:<port>` and waits for one callback on `/`.
pub async fn listen(port: u16, timeout: Duration) -> Result<CallbackParams> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    CallbackListener::bind(addr, "/").await?.wait(timeout).await
}

/// Router serving the callback on `path` (and `/` when different).
pub(crate) fn callback_router(path: &str, sender: ResultSender) -> Router {
    let mut router = Router::new().route("/", get(handle_callback));
    if path != "/" {
        router = router.route(path, get(handle_callback));
    }
    router.with_state(sender)
}

async fn handle_callback(
    State(sender): State<ResultSender>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let result = match (query.code, query.state, query.error) {
        (_, _, Some(error)) => {
            let description = query
                .error_description
                .unwrap_or_else(|| "no description".to_string());
            warn!(error = %error, description = %description, "Provider reported authorization error");
            Err(CredentialError::AuthorizationDenied(format!(
                "{}: {}",
                error, description
            )))
        }
        (Some(code), Some(state), None) => Ok(CallbackParams { code, state }),
        _ => {
            debug!("Ignoring request without authorization parameters");
            return (
                StatusCode::BAD_REQUEST,
                "Missing 'code' and 'state' parameters",
            )
                .into_response();
        }
    };

    let Some(tx) = sender
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take()
    else {
        return (StatusCode::GONE, "Authorization callback already handled").into_response();
    };

    let page = if result.is_ok() { SUCCESS_PAGE } else { FAILURE_PAGE };
    let _ = tx.send(result);
    Html(page).into_response()
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}
