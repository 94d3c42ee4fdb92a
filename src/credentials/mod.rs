//! Encrypted credential storage for OAuth tokens.
//!
//! One credential record per identity, sealed with AES-256-GCM under a key
//! derived from the master secret and a per-store salt.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       EncryptedTokenStore                │
//! │  - save / load / delete per identity     │
//! │  - atomic write (tmp + fsync + rename)   │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       Encryption Module                  │
//! │  - Argon2id key derivation               │
//! │  - AES-256-GCM, fresh nonce per save     │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       Token directory                    │
//! │  - store.salt                            │
//! │  - <hex(identity)>.json (versioned blob) │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use credvault::credentials::{Credential, EncryptedTokenStore, KdfParams};
//! use chrono::{Duration, Utc};
//!
//! # fn main() -> credvault::error::Result<()> {
//! let store = EncryptedTokenStore::open("/tmp/tokens", "master-secret", KdfParams::default())?;
//!
//! let now = Utc::now();
//! let credential = Credential {
//!     identity: "alice@example.com".to_string(),
//!     access_token: "ya29.access".to_string(),
//!     refresh_token: Some("1//refresh".to_string()),
//!     expiry: now + Duration::hours(1),
//!     scopes: ["https://www.googleapis.com/auth/gmail.modify".to_string()].into(),
//!     issued_at: now,
//! };
//! store.save("alice@example.com", &credential)?;
//!
//! let loaded = store.load("alice@example.com")?;
//! assert_eq!(loaded, credential);
//!
//! store.delete("alice@example.com")?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

mod encryption;
mod storage;

pub use encryption::{derive_key, generate_salt, DerivedKey, KdfParams};
pub use storage::{EncryptedBlob, EncryptedTokenStore, BLOB_VERSION};

#[cfg(test)]
pub(crate) use encryption::test_params;

/// OAuth credential for one account identity.
///
/// `expiry` is always absolute. A credential past its expiry with no refresh
/// token is terminal: only a new authorization flow can replace it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Opaque account key
    pub identity: String,

    /// OAuth access token (used for API requests)
    pub access_token: String,

    /// OAuth refresh token, absent for some grant types
    pub refresh_token: Option<String>,

    /// When the access token expires (UTC)
    pub expiry: DateTime<Utc>,

    /// Scopes granted by the provider
    pub scopes: BTreeSet<String>,

    /// When the access token was issued (UTC)
    pub issued_at: DateTime<Utc>,
}

impl Credential {
    /// True when `now + margin` has reached the expiry.
    pub fn expires_within(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now + margin >= self.expiry
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_within(now, Duration::zero())
    }

    /// Freshness check used by the cache and the refresh coordinator.
    ///
    /// The safety margin is capped at half the token's issued lifetime, so a
    /// provider that hands out tokens shorter than the margin still yields a
    /// usable window instead of a token that is stale on arrival.
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let half_lifetime = (self.expiry - self.issued_at) / 2;
        let margin = margin.min(half_lifetime.max(Duration::zero()));
        self.expires_within(now, margin)
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }

    /// Expired and impossible to refresh.
    pub fn is_terminal(&self, now: DateTime<Utc>) -> bool {
        self.is_expired(now) && !self.can_refresh()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("identity", &self.identity)
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expiry", &self.expiry)
            .field("scopes", &self.scopes)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}
