//! Encrypted credential storage on the local filesystem.
//!
//! One versioned blob per identity. Writes are atomic: the blob goes to a
//! `.tmp` file, is fsynced, then renamed over the final path, so a crash
//! mid-write never leaves a half-written blob behind.

use super::encryption::{self, DerivedKey, KdfParams, SALT_SIZE};
use super::Credential;
use crate::error::{CredentialError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Current on-disk blob format version
pub const BLOB_VERSION: u32 = 1;

const SALT_FILE: &str = "store.salt";
const BLOB_EXTENSION: &str = "json";

/// On-disk representation of a [`Credential`].
///
/// Binary fields are base64. `salt` and `kdf_params` record what the key was
/// derived from when the blob was sealed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub version: u32,
    pub identity: String,
    pub ciphertext: String,
    pub nonce: String,
    pub salt: String,
    pub kdf_params: KdfParams,
    pub updated_at: DateTime<Utc>,
}

/// Encrypted credential storage backed by a token directory.
///
/// # Layout
/// ```text
/// <dir>/store.salt            -- base64 random salt, created on first open
/// <dir>/<hex(identity)>.json  -- EncryptedBlob
/// ```
///
/// # Security
/// - The key is derived once per process (Argon2id) and kept in memory only
/// - Every save re-encrypts the full record under a fresh nonce
/// - Tampering, wrong key, or unknown format → `DecryptionFailed`, never garbage
/// - Files are created with mode 0600, the directory with 0700 (unix)
///
/// # Thread Safety
/// Writers are serialized by an internal lock; readers only ever see a
/// complete blob thanks to the rename.
pub struct EncryptedTokenStore {
    dir: PathBuf,
    master_secret: String,
    salt: [u8; SALT_SIZE],
    kdf_params: KdfParams,
    key: DerivedKey,
    write_lock: Mutex<()>,
}

impl EncryptedTokenStore {
    /// Creates or opens a token store in `dir`.
    ///
    /// Loads the persisted salt (or creates one) and derives the store key.
    /// This is the slow step; call it once at startup.
    pub fn open<P: AsRef<Path>>(dir: P, master_secret: &str, kdf_params: KdfParams) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        restrict_permissions(&dir, 0o700);

        let salt = load_or_create_salt(&dir)?;
        let key = encryption::derive_key(master_secret, &salt, &kdf_params)?;

        debug!(dir = %dir.display(), "Token store opened");

        Ok(Self {
            dir,
            master_secret: master_secret.to_string(),
            salt,
            kdf_params,
            key,
            write_lock: Mutex::new(()),
        })
    }

    /// Directory holding the blobs
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Encrypts and persists the credential for `identity`, replacing any
    /// previous one.
    ///
    /// The credential must belong to `identity`; a mismatch would produce a
    /// blob that never loads again.
    pub fn save(&self, identity: &str, credential: &Credential) -> Result<()> {
        if credential.identity != identity {
            return Err(CredentialError::Storage(format!(
                "credential for '{}' cannot be saved under '{}'",
                credential.identity, identity
            )));
        }

        let plaintext = serde_json::to_vec(credential)
            .map_err(|e| CredentialError::Storage(format!("failed to serialize credential: {}", e)))?;

        let (ciphertext, nonce) = encryption::encrypt(&plaintext, &self.key, identity.as_bytes())?;

        let blob = EncryptedBlob {
            version: BLOB_VERSION,
            identity: identity.to_string(),
            ciphertext,
            nonce,
            salt: BASE64.encode(self.salt),
            kdf_params: self.kdf_params.clone(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&blob)
            .map_err(|e| CredentialError::Storage(format!("failed to serialize blob: {}", e)))?;

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| CredentialError::Storage("store lock poisoned".to_string()))?;
        write_atomic(&self.blob_path(identity), &json)?;

        debug!(identity = %identity, "Credential saved");
        Ok(())
    }

    /// Loads and decrypts the credential for `identity`.
    ///
    /// # Returns
    /// * `Err(NotFound)` - nothing was ever stored for this identity
    /// * `Err(DecryptionFailed)` - blob is corrupt, tampered, of an unknown
    ///   version, or sealed under a different master secret
    /// * `Err(Storage)` - the file could not be read
    pub fn load(&self, identity: &str) -> Result<Credential> {
        let raw = match fs::read(self.blob_path(identity)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(CredentialError::NotFound),
            Err(e) => return Err(e.into()),
        };

        let blob: EncryptedBlob = serde_json::from_slice(&raw).map_err(|_| {
            warn!(identity = %identity, "Stored blob is not valid JSON");
            CredentialError::DecryptionFailed
        })?;

        if blob.version != BLOB_VERSION {
            warn!(identity = %identity, version = blob.version, "Unsupported blob version");
            return Err(CredentialError::DecryptionFailed);
        }
        if blob.identity != identity {
            warn!(identity = %identity, "Stored blob belongs to another identity");
            return Err(CredentialError::DecryptionFailed);
        }

        let (credential, migrated) = self.open_blob(identity, &blob)?;

        if migrated {
            match self.save(identity, &credential) {
                Ok(()) => info!(
                    identity = %identity,
                    from = ?blob.kdf_params,
                    to = ?self.kdf_params,
                    "Migrated credential to current key derivation parameters"
                ),
                Err(e) => warn!(identity = %identity, error = %e, "Failed to migrate credential"),
            }
        }

        Ok(credential)
    }

    /// Deletes the credential for `identity`. Deleting a missing entry succeeds.
    pub fn delete(&self, identity: &str) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| CredentialError::Storage("store lock poisoned".to_string()))?;

        match fs::remove_file(self.blob_path(identity)) {
            Ok(()) => {
                debug!(identity = %identity, "Credential deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists identities that have a stored blob, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut identities = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match hex::decode(stem).ok().and_then(|b| String::from_utf8(b).ok()) {
                Some(identity) => identities.push(identity),
                None => warn!(file = %path.display(), "Skipping unrecognized file in token store"),
            }
        }

        identities.sort();
        Ok(identities)
    }

    /// Decrypts a blob, deriving a one-off key when it was sealed under other
    /// parameters. Returns whether the blob needs re-sealing.
    fn open_blob(&self, identity: &str, blob: &EncryptedBlob) -> Result<(Credential, bool)> {
        let blob_salt = BASE64
            .decode(&blob.salt)
            .map_err(|_| CredentialError::DecryptionFailed)?;

        let current = blob_salt == self.salt && blob.kdf_params == self.kdf_params;
        let legacy_key;
        let key = if current {
            &self.key
        } else {
            legacy_key = encryption::derive_key(&self.master_secret, &blob_salt, &blob.kdf_params)
                .map_err(|_| CredentialError::DecryptionFailed)?;
            &legacy_key
        };

        let plaintext = encryption::decrypt(&blob.ciphertext, &blob.nonce, key, identity.as_bytes())
            .inspect_err(|_| warn!(identity = %identity, "Credential blob failed authentication"))?;

        let credential: Credential =
            serde_json::from_slice(&plaintext).map_err(|_| CredentialError::DecryptionFailed)?;

        if credential.identity != identity {
            return Err(CredentialError::DecryptionFailed);
        }

        Ok((credential, !current))
    }

    fn blob_path(&self, identity: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", hex::encode(identity.as_bytes()), BLOB_EXTENSION))
    }
}

impl std::fmt::Debug for EncryptedTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedTokenStore")
            .field("dir", &self.dir)
            .field("kdf_params", &self.kdf_params)
            .finish_non_exhaustive()
    }
}

fn load_or_create_salt(dir: &Path) -> Result<[u8; SALT_SIZE]> {
    let path = dir.join(SALT_FILE);

    match fs::read_to_string(&path) {
        Ok(encoded) => {
            let bytes = BASE64
                .decode(encoded.trim())
                .map_err(|_| CredentialError::Storage("store salt file is corrupt".to_string()))?;
            bytes
                .try_into()
                .map_err(|_| CredentialError::Storage("store salt has the wrong length".to_string()))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            let salt = encryption::generate_salt();
            write_atomic(&path, BASE64.encode(salt).as_bytes())?;
            info!(path = %path.display(), "Created new token store salt");
            Ok(salt)
        }
        Err(e) => Err(e.into()),
    }
}

/// Writes to `<path>.tmp`, fsyncs, then renames over `path`.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");

    {
        let mut file = create_private(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    Ok(())
}

#[cfg(unix)]
fn create_private(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_private(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().write(true).create(true).truncate(true).open(path)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
        warn!(path = %path.display(), error = %e, "Failed to restrict token directory permissions");
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) {}
