//! Account passwords at rest: AES-256-GCM with a local key file, stored as
//! base64 of `nonce || ciphertext`.

use std::path::{Path, PathBuf};

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

#[derive(Debug, Error)]
pub(crate) enum CredentialError {
    #[error("key file {path}: {reason}")]
    Key { path: PathBuf, reason: String },
    #[error("encryption failed: {0}")]
    Encryption(String),
    #[error("decryption failed: {0}")]
    Decryption(String),
    #[error("invalid encrypted value: {0}")]
    InvalidFormat(String),
}

pub(crate) trait CredentialStore: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError>;
    fn decrypt(&self, token: &str) -> Result<String, CredentialError>;
}

pub(crate) struct KeyFileCredentials {
    cipher: Aes256Gcm,
}

impl KeyFileCredentials {
    pub(crate) fn load(path: &Path) -> Result<Self, CredentialError> {
        let key_error = |reason: String| CredentialError::Key {
            path: path.to_path_buf(),
            reason,
        };
        let encoded = std::fs::read_to_string(path).map_err(|e| key_error(e.to_string()))?;
        let key = BASE64
            .decode(encoded.trim())
            .map_err(|e| key_error(format!("not base64: {}", e)))?;
        Self::from_key(&key).map_err(|_| key_error(format!("expected {} key bytes", KEY_SIZE)))
    }

    /// Writes a fresh random key. Refuses to replace an existing file, since
    /// every stored password would become unreadable.
    pub(crate) fn generate(path: &Path) -> Result<Self, CredentialError> {
        let key_error = |reason: String| CredentialError::Key {
            path: path.to_path_buf(),
            reason,
        };
        if path.exists() {
            return Err(key_error("already exists".to_string()));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| key_error(e.to_string()))?;
        }
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        std::fs::write(path, BASE64.encode(key)).map_err(|e| key_error(e.to_string()))?;
        restrict_permissions(path);
        tracing::info!(path = %path.display(), "generated credential key");
        Self::from_key(&key)
    }

    pub(crate) fn from_key(key: &[u8]) -> Result<Self, CredentialError> {
        if key.len() != KEY_SIZE {
            return Err(CredentialError::InvalidFormat(format!(
                "key is {} bytes",
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CredentialError::InvalidFormat(e.to_string()))?;
        Ok(Self { cipher })
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(err) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        tracing::warn!(path = %path.display(), error = %err, "could not restrict key file permissions");
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

impl CredentialStore for KeyFileCredentials {
    fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError> {
        if plaintext.is_empty() {
            return Err(CredentialError::Encryption(
                "refusing to encrypt an empty password".to_string(),
            ));
        }
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(combined))
    }

    fn decrypt(&self, token: &str) -> Result<String, CredentialError> {
        let combined = BASE64
            .decode(token.trim())
            .map_err(|e| CredentialError::InvalidFormat(format!("not base64: {}", e)))?;
        if combined.len() <= NONCE_SIZE {
            return Err(CredentialError::InvalidFormat(format!(
                "too short: {} bytes",
                combined.len()
            )));
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CredentialError::Decryption("wrong key or corrupted value".to_string()))?;
        String::from_utf8(plaintext).map_err(|e| CredentialError::Decryption(e.to_string()))
    }
}
