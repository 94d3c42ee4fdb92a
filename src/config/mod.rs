use crate::cache::CacheSettings;
use crate::credentials::KdfParams;
use crate::error::CredentialError;
use crate::oauth::ProviderConfig;
use anyhow::Context;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "CREDVAULT_CONFIG";

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";
const GMAIL_MODIFY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.modify";
const CALENDAR_SCOPE: &str = "https://www.googleapis.com/auth/calendar";

/// Longest accepted safety margin and authorization request lifetime (one day)
const MAX_WINDOW_SECONDS: i64 = 24 * 60 * 60;

/// Complete credvault configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredvaultConfig {
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub callback: CallbackConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
}

/// OAuth client and provider endpoints
#[derive(Clone, Deserialize)]
pub struct OAuthConfig {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_revoke_url")]
    pub revoke_url: Option<String>,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// Also request calendar access
    #[serde(default)]
    pub calendar_enabled: bool,
    #[serde(default = "default_calendar_scopes")]
    pub calendar_scopes: Vec<String>,
    /// Ask for a refresh token (`access_type=offline&prompt=consent`)
    #[serde(default = "default_offline_access")]
    pub offline_access: bool,
}

fn default_auth_url() -> String {
    GOOGLE_AUTH_URL.to_string()
}

fn default_token_url() -> String {
    GOOGLE_TOKEN_URL.to_string()
}

fn default_revoke_url() -> Option<String> {
    Some(GOOGLE_REVOKE_URL.to_string())
}

fn default_scopes() -> Vec<String> {
    vec![GMAIL_MODIFY_SCOPE.to_string()]
}

fn default_calendar_scopes() -> Vec<String> {
    vec![CALENDAR_SCOPE.to_string()]
}

fn default_offline_access() -> bool {
    true
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            auth_url: default_auth_url(),
            token_url: default_token_url(),
            revoke_url: default_revoke_url(),
            scopes: default_scopes(),
            calendar_enabled: false,
            calendar_scopes: default_calendar_scopes(),
            offline_access: default_offline_access(),
        }
    }
}

impl std::fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("revoke_url", &self.revoke_url)
            .field("scopes", &self.scopes)
            .field("calendar_enabled", &self.calendar_enabled)
            .field("offline_access", &self.offline_access)
            .finish()
    }
}

/// Token storage configuration
#[derive(Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory for encrypted token blobs (default: `~/.credvault/tokens`)
    #[serde(default)]
    pub token_path: Option<PathBuf>,

    /// Master secret the encryption key is derived from. Prefer the
    /// environment variable over putting this in a file.
    #[serde(default)]
    pub master_secret: Option<String>,

    #[serde(default = "default_kdf_memory_kib")]
    pub kdf_memory_kib: u32,
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
    #[serde(default = "default_kdf_parallelism")]
    pub kdf_parallelism: u32,
}

fn default_kdf_memory_kib() -> u32 {
    KdfParams::default().memory_kib
}

fn default_kdf_iterations() -> u32 {
    KdfParams::default().iterations
}

fn default_kdf_parallelism() -> u32 {
    KdfParams::default().parallelism
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            token_path: None,
            master_secret: None,
            kdf_memory_kib: default_kdf_memory_kib(),
            kdf_iterations: default_kdf_iterations(),
            kdf_parallelism: default_kdf_parallelism(),
        }
    }
}

impl std::fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageConfig")
            .field("token_path", &self.token_path)
            .field("master_secret", &self.master_secret.as_ref().map(|_| "<redacted>"))
            .field("kdf_memory_kib", &self.kdf_memory_kib)
            .field("kdf_iterations", &self.kdf_iterations)
            .field("kdf_parallelism", &self.kdf_parallelism)
            .finish()
    }
}

/// Local callback listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackConfig {
    #[serde(default = "default_callback_port")]
    pub port: u16,
    #[serde(default = "default_callback_path")]
    pub path: String,
    /// Overrides the redirect URI derived from port and path. The listener
    /// binds the port and path of this URI, which must name a loopback host.
    #[serde(default)]
    pub redirect_uri: Option<String>,
    /// How long the listener waits for the browser (seconds)
    #[serde(default = "default_callback_timeout")]
    pub timeout_seconds: u64,
    /// How long a pending authorization request stays valid (seconds)
    #[serde(default = "default_state_ttl")]
    pub state_ttl_seconds: i64,
}

fn default_callback_port() -> u16 {
    8000
}

fn default_callback_path() -> String {
    "/auth/callback".to_string()
}

fn default_callback_timeout() -> u64 {
    300
}

fn default_state_ttl() -> i64 {
    600
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            port: default_callback_port(),
            path: default_callback_path(),
            redirect_uri: None,
            timeout_seconds: default_callback_timeout(),
            state_ttl_seconds: default_state_ttl(),
        }
    }
}

/// Refresh timing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Refresh this many seconds before expiry
    #[serde(default = "default_safety_margin")]
    pub safety_margin_seconds: i64,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    /// How often expired authorization requests are purged (seconds)
    #[serde(default = "default_cleanup_interval")]
    pub state_cleanup_interval_seconds: u64,
}

fn default_safety_margin() -> i64 {
    300
}

fn default_retry_backoff() -> u64 {
    500
}

fn default_cleanup_interval() -> u64 {
    60
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            safety_margin_seconds: default_safety_margin(),
            retry_backoff_ms: default_retry_backoff(),
            state_cleanup_interval_seconds: default_cleanup_interval(),
        }
    }
}

impl CredvaultConfig {
    /// Applies `CREDVAULT_*` environment variables on top of file values
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Applies overrides from `lookup`; empty values are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = get("CREDVAULT_CLIENT_ID") {
            self.oauth.client_id = Some(value);
        }
        if let Some(value) = get("CREDVAULT_CLIENT_SECRET") {
            self.oauth.client_secret = Some(value);
        }
        if let Some(value) = get("CREDVAULT_REDIRECT_URI") {
            self.callback.redirect_uri = Some(value);
        }
        if let Some(value) = get("CREDVAULT_TOKEN_PATH") {
            self.storage.token_path = Some(PathBuf::from(value));
        }
        if let Some(value) = get("CREDVAULT_MASTER_SECRET") {
            self.storage.master_secret = Some(value);
        }
    }

    pub fn redirect_uri(&self) -> String {
        match &self.callback.redirect_uri {
            Some(uri) => uri.clone(),
            None => format!(
                "http://127.0.0.1:{}{}",
                self.callback.port, self.callback.path
            ),
        }
    }

    /// Address and path the callback listener must serve so the provider's
    /// redirect reaches it.
    pub fn callback_endpoint(&self) -> Result<(SocketAddr, String), CredentialError> {
        let redirect_uri = self.redirect_uri();
        let invalid = |reason: &str| {
            CredentialError::Config(format!("redirect URI '{}' {}", redirect_uri, reason))
        };

        let url = reqwest::Url::parse(&redirect_uri).map_err(|_| invalid("is not a valid URL"))?;
        if url.scheme() != "http" {
            return Err(invalid("must use http for the local listener"));
        }

        let host = url.host_str().unwrap_or_default();
        let ip = if host.eq_ignore_ascii_case("localhost") {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            host.trim_start_matches('[')
                .trim_end_matches(']')
                .parse::<IpAddr>()
                .map_err(|_| invalid("must name a loopback address"))?
        };
        if !ip.is_loopback() {
            return Err(invalid("must name a loopback address"));
        }

        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("has no port"))?;

        Ok((SocketAddr::new(ip, port), url.path().to_string()))
    }

    /// Rejects values that would panic or stall at runtime.
    pub fn validate(&self) -> Result<(), CredentialError> {
        if self.refresh.state_cleanup_interval_seconds == 0 {
            return Err(CredentialError::Config(
                "refresh.state_cleanup_interval_seconds must be greater than 0".to_string(),
            ));
        }
        if !(0..=MAX_WINDOW_SECONDS).contains(&self.refresh.safety_margin_seconds) {
            return Err(CredentialError::Config(format!(
                "refresh.safety_margin_seconds must be between 0 and {}",
                MAX_WINDOW_SECONDS
            )));
        }
        if !(1..=MAX_WINDOW_SECONDS).contains(&self.callback.state_ttl_seconds) {
            return Err(CredentialError::Config(format!(
                "callback.state_ttl_seconds must be between 1 and {}",
                MAX_WINDOW_SECONDS
            )));
        }
        if self.callback.timeout_seconds == 0 {
            return Err(CredentialError::Config(
                "callback.timeout_seconds must be greater than 0".to_string(),
            ));
        }
        self.kdf_params().validate()?;
        self.callback_endpoint()?;
        Ok(())
    }

    /// Scopes to request, calendar scopes included when enabled
    pub fn scopes(&self) -> Vec<String> {
        let mut scopes = self.oauth.scopes.clone();
        if self.oauth.calendar_enabled {
            for scope in &self.oauth.calendar_scopes {
                if !scopes.contains(scope) {
                    scopes.push(scope.clone());
                }
            }
        }
        scopes
    }

    pub fn provider_config(&self) -> Result<ProviderConfig, CredentialError> {
        let client_id = self
            .oauth
            .client_id
            .clone()
            .ok_or_else(|| CredentialError::Config("OAuth client id is not set".to_string()))?;

        let extra_auth_params = if self.oauth.offline_access {
            vec![
                ("access_type".to_string(), "offline".to_string()),
                ("prompt".to_string(), "consent".to_string()),
            ]
        } else {
            Vec::new()
        };

        Ok(ProviderConfig {
            auth_url: self.oauth.auth_url.clone(),
            token_url: self.oauth.token_url.clone(),
            revoke_url: self.oauth.revoke_url.clone(),
            scopes: self.scopes(),
            client_id,
            client_secret: self.oauth.client_secret.clone(),
            redirect_uri: self.redirect_uri(),
            extra_auth_params,
        })
    }

    pub fn token_dir(&self) -> Result<PathBuf, CredentialError> {
        if let Some(path) = &self.storage.token_path {
            return Ok(path.clone());
        }
        dirs::home_dir()
            .map(|home| home.join(".credvault").join("tokens"))
            .ok_or_else(|| {
                CredentialError::Config(
                    "no home directory; set storage.token_path or CREDVAULT_TOKEN_PATH".to_string(),
                )
            })
    }

    pub fn master_secret(&self) -> Result<&str, CredentialError> {
        self.storage
            .master_secret
            .as_deref()
            .ok_or_else(|| {
                CredentialError::Config(
                    "master secret is not set (CREDVAULT_MASTER_SECRET)".to_string(),
                )
            })
    }

    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            memory_kib: self.storage.kdf_memory_kib,
            iterations: self.storage.kdf_iterations,
            parallelism: self.storage.kdf_parallelism,
            ..KdfParams::default()
        }
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            safety_margin: chrono::Duration::seconds(self.refresh.safety_margin_seconds),
            retry_backoff: std::time::Duration::from_millis(self.refresh.retry_backoff_ms),
        }
    }
}

/// Load configuration from a TOML file, then apply environment overrides.
///
/// With no path, `CREDVAULT_CONFIG` is consulted; when neither names a file
/// the defaults are used.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<CredvaultConfig> {
    let path = path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));

    let mut config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        }
        None => CredvaultConfig::default(),
    };

    config.apply_env_overrides();
    config.validate().context("Invalid configuration")?;
    Ok(config)
}
