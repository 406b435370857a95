//! AES-GCM encryption for secret settings.
//!
//! Secret setting values are stored as `base64(nonce || ciphertext)`; readers
//! that lack the key see opaque ciphertext and nothing else.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};

use crate::{CoreError, Result};

const NONCE_LEN: usize = 12;

/// Encrypts and decrypts secret setting values with a key derived from an
/// operator-supplied passphrase.
#[derive(Clone)]
pub struct Vault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault").finish_non_exhaustive()
    }
}

impl Vault {
    pub fn from_passphrase(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CoreError::Internal(format!("encrypt: {e}")))?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let blob = BASE64
            .decode(encoded)
            .map_err(|e| CoreError::Invalid(format!("ciphertext encoding: {e}")))?;
        if blob.len() < NONCE_LEN {
            return Err(CoreError::Invalid("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CoreError::Invalid("ciphertext does not authenticate".into()))?;
        String::from_utf8(plaintext).map_err(|e| CoreError::Invalid(format!("plaintext utf8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let vault = Vault::from_passphrase("hunter2");
        let encoded = vault.encrypt("api-token-value").unwrap();
        assert_ne!(encoded, "api-token-value");
        assert_eq!(vault.decrypt(&encoded).unwrap(), "api-token-value");
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let vault = Vault::from_passphrase("hunter2");
        let other = Vault::from_passphrase("hunter3");
        let encoded = vault.encrypt("secret").unwrap();
        assert!(other.decrypt(&encoded).is_err());
    }

    #[test]
    fn nonces_differ_between_encryptions() {
        let vault = Vault::from_passphrase("hunter2");
        let a = vault.encrypt("same").unwrap();
        let b = vault.encrypt("same").unwrap();
        assert_ne!(a, b);
    }
}
