//! Secret box for task passwords
//!
//! Passwords are stored as AES-256-GCM ciphertext with a fresh random nonce
//! per encryption, encoded as `enc:v1:<base64(nonce || ciphertext)>`. The
//! version tag makes detecting already-encrypted values trivial, which the
//! startup migration relies on. Key provenance is the caller's problem; the
//! engine only ever sees the 32-byte key.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as B64_STANDARD, Engine as _};
use rand::RngCore;
use shared::WardenError;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use zeroize::Zeroizing;

/// Version tag carried by every ciphertext this box produces.
pub const CIPHERTEXT_PREFIX: &str = "enc:v1:";

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Returns true when `s` carries the ciphertext version tag.
pub fn looks_encrypted(s: &str) -> bool {
    s.starts_with(CIPHERTEXT_PREFIX)
}

/// Envelope encryption for stored passwords.
#[derive(Clone)]
pub struct SecretBox {
    cipher: Arc<Aes256Gcm>,
}

impl SecretBox {
    /// Build a secret box from a raw 32-byte key.
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        let cipher = Aes256Gcm::new_from_slice(key).expect("key length is fixed at 32 bytes");
        Self {
            cipher: Arc::new(cipher),
        }
    }

    /// Build a secret box from a key file, creating the file with fresh
    /// random key material on first use.
    pub fn from_key_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = Zeroizing::new(
                std::fs::read(path)
                    .with_context(|| format!("Failed to read key file: {}", path.display()))?,
            );
            if raw.len() != KEY_LEN {
                return Err(WardenError::SecretBox(format!(
                    "Key file {} has {} bytes, expected {}",
                    path.display(),
                    raw.len(),
                    KEY_LEN
                ))
                .into());
            }
            let mut key = Zeroizing::new([0u8; KEY_LEN]);
            key.copy_from_slice(&raw);
            return Ok(Self::new(&key));
        }

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        rand::rng().fill_bytes(&mut key[..]);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create key directory: {}", parent.display())
            })?;
        }
        std::fs::write(path, &key[..])
            .with_context(|| format!("Failed to write key file: {}", path.display()))?;

        // The key file must not be readable by other users.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("Failed to restrict key file: {}", path.display()))?;
        }

        info!("Generated new secret key at {}", path.display());
        Ok(Self::new(&key))
    }

    /// Encrypt a plaintext password into a tagged ciphertext string.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| WardenError::SecretBox("Encryption failed".to_string()))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&ciphertext);
        Ok(format!("{}{}", CIPHERTEXT_PREFIX, B64_STANDARD.encode(payload)))
    }

    /// Decrypt a tagged ciphertext string.
    ///
    /// The returned plaintext is wiped from memory when dropped.
    pub fn decrypt(&self, ciphertext: &str) -> Result<Zeroizing<String>> {
        let encoded = ciphertext
            .strip_prefix(CIPHERTEXT_PREFIX)
            .ok_or_else(|| WardenError::SecretBox("Unrecognized ciphertext format".to_string()))?;

        let payload = B64_STANDARD
            .decode(encoded)
            .map_err(|e| WardenError::SecretBox(format!("Invalid base64 payload: {}", e)))?;
        if payload.len() < NONCE_LEN {
            return Err(WardenError::SecretBox("Ciphertext too short".to_string()).into());
        }

        let (nonce_bytes, body) = payload.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), body)
            .map_err(|_| WardenError::SecretBox("Decryption failed".to_string()))?;

        let text = String::from_utf8(plaintext)
            .map_err(|_| WardenError::SecretBox("Decrypted payload is not UTF-8".to_string()))?;
        Ok(Zeroizing::new(text))
    }
}
