//! Key derivation and AES-256-GCM sealing for stored credentials.
//!
//! The symmetric key is derived from an externally supplied master secret and
//! a persisted random salt with Argon2id. Every seal draws a fresh 96-bit nonce.
//! The identity is bound as associated data, so a blob moved to another
//! identity's slot fails to open.

use crate::error::{CredentialError, Result};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Size of the derived key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Size of the per-store salt in bytes
pub const SALT_SIZE: usize = 16;

/// Upper bounds on accepted Argon2 costs. Blobs carry their own params, so
/// anything beyond these is treated as tampering rather than derived.
const MAX_MEMORY_KIB: u32 = 1024 * 1024;
const MAX_ITERATIONS: u32 = 10;
const MAX_PARALLELISM: u32 = 16;

/// Derived symmetric key. Never serialized, never logged.
#[derive(Clone)]
pub struct DerivedKey([u8; KEY_SIZE]);

impl DerivedKey {
    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(<redacted>)")
    }
}

/// Key-derivation parameters, persisted alongside every blob so a change of
/// parameters can be detected and migrated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    /// Argon2 memory cost in KiB
    pub memory_kib: u32,
    /// Argon2 time cost (passes over memory)
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // OWASP baseline for Argon2id: m=19456 (19 MiB), t=2, p=1
        Self {
            algorithm: "argon2id".to_string(),
            memory_kib: 19456,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Checks the params are a supported algorithm within the cost bounds.
    pub fn validate(&self) -> Result<()> {
        if self.algorithm != "argon2id" {
            return Err(CredentialError::Config(format!(
                "unsupported key derivation algorithm '{}'",
                self.algorithm
            )));
        }
        if self.memory_kib == 0 || self.memory_kib > MAX_MEMORY_KIB {
            return Err(CredentialError::Config(format!(
                "Argon2 memory must be between 1 and {} KiB, got {}",
                MAX_MEMORY_KIB, self.memory_kib
            )));
        }
        if self.iterations == 0 || self.iterations > MAX_ITERATIONS {
            return Err(CredentialError::Config(format!(
                "Argon2 iterations must be between 1 and {}, got {}",
                MAX_ITERATIONS, self.iterations
            )));
        }
        if self.parallelism == 0 || self.parallelism > MAX_PARALLELISM {
            return Err(CredentialError::Config(format!(
                "Argon2 parallelism must be between 1 and {}, got {}",
                MAX_PARALLELISM, self.parallelism
            )));
        }
        Ok(())
    }
}

/// Generates a random salt for a new store.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Derives the store key from the master secret and salt.
///
/// Deliberately slow: the cost is governed by `params`.
pub fn derive_key(master_secret: &str, salt: &[u8], params: &KdfParams) -> Result<DerivedKey> {
    params.validate()?;
    if master_secret.is_empty() {
        return Err(CredentialError::Config("master secret must not be empty".to_string()));
    }

    let argon_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| CredentialError::Config(format!("invalid Argon2 parameters: {}", e)))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(master_secret.as_bytes(), salt, &mut key)
        .map_err(|e| CredentialError::Config(format!("key derivation failed: {}", e)))?;

    Ok(DerivedKey(key))
}

/// Encrypts `plaintext` with a random nonce, binding `aad` to the ciphertext.
///
/// Returns `(ciphertext, nonce)`, both base64-encoded.
pub fn encrypt(plaintext: &[u8], key: &DerivedKey, aad: &[u8]) -> Result<(String, String)> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| CredentialError::Storage("failed to create cipher".to_string()))?;

    // Never reuse a nonce with the same key
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CredentialError::Storage("encryption failed".to_string()))?;

    Ok((BASE64.encode(&ciphertext), BASE64.encode(nonce)))
}

/// Decrypts a sealed payload. Any malformed input, tampering, or wrong key
/// fails closed with [`CredentialError::DecryptionFailed`].
pub fn decrypt(ciphertext: &str, nonce: &str, key: &DerivedKey, aad: &[u8]) -> Result<Vec<u8>> {
    let ciphertext = BASE64
        .decode(ciphertext)
        .map_err(|_| CredentialError::DecryptionFailed)?;
    let nonce_bytes = BASE64.decode(nonce).map_err(|_| CredentialError::DecryptionFailed)?;

    if nonce_bytes.len() != NONCE_SIZE {
        return Err(CredentialError::DecryptionFailed);
    }

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| CredentialError::DecryptionFailed)?;

    cipher
        .decrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: ciphertext.as_ref(),
                aad,
            },
        )
        .map_err(|_| CredentialError::DecryptionFailed)
}

#[cfg(test)]
pub(crate) fn test_params() -> KdfParams {
    KdfParams {
        memory_kib: 64,
        iterations: 1,
        ..KdfParams::default()
    }
}
