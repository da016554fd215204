//! AES-256-GCM encryption for upstream session credentials at rest.
//!
//! Ciphertexts carry a recognizable `enc:v1:` prefix so the startup
//! migration can detect legacy plaintext columns and re-encrypt them.
//!
//! Security properties:
//! - AES-256 in GCM mode: confidentiality plus tamper detection
//! - Unique 96-bit nonce per encryption
//! - Stored form: `enc:v1:` + base64(nonce || ciphertext || tag)

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use thiserror::Error;

/// Marker prepended to every ciphertext; anything without it is treated as
/// legacy plaintext by the migration.
const CIPHERTEXT_PREFIX: &str = "enc:v1:";

#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key")]
    InvalidKey,

    #[error("Invalid ciphertext format")]
    InvalidFormat,
}

pub type Result<T> = std::result::Result<T, EncryptionError>;

/// Thread-safe; can be cloned and shared across tasks.
#[derive(Clone)]
pub struct EncryptionService {
    cipher: Aes256Gcm,
}

impl EncryptionService {
    /// Create from a base64-encoded key. Key must decode to exactly 32 bytes.
    pub fn new(base64_key: &str) -> Result<Self> {
        let key_bytes = BASE64
            .decode(base64_key.trim())
            .map_err(|_| EncryptionError::InvalidKey)?;

        if key_bytes.len() != 32 {
            return Err(EncryptionError::InvalidKey);
        }

        let cipher =
            Aes256Gcm::new_from_slice(&key_bytes).map_err(|_| EncryptionError::InvalidKey)?;

        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        // Nonce MUST be unique per encryption.
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);

        Ok(format!("{CIPHERTEXT_PREFIX}{}", BASE64.encode(&combined)))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String> {
        if stored.is_empty() {
            return Ok(String::new());
        }

        let encoded = stored
            .strip_prefix(CIPHERTEXT_PREFIX)
            .ok_or(EncryptionError::InvalidFormat)?;

        let combined = BASE64
            .decode(encoded)
            .map_err(|_| EncryptionError::InvalidFormat)?;

        // At least nonce (12) + tag (16).
        if combined.len() < 28 {
            return Err(EncryptionError::InvalidFormat);
        }

        let (nonce_bytes, encrypted_data) = combined.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext_bytes = self
            .cipher
            .decrypt(nonce, encrypted_data)
            .map_err(|e| EncryptionError::DecryptionFailed(e.to_string()))?;

        String::from_utf8(plaintext_bytes)
            .map_err(|_| EncryptionError::DecryptionFailed("Invalid UTF-8".to_string()))
    }

    pub fn encrypt_optional(&self, plaintext: Option<&String>) -> Result<Option<String>> {
        match plaintext {
            Some(text) => Ok(Some(self.encrypt(text)?)),
            None => Ok(None),
        }
    }

    pub fn decrypt_optional(&self, stored: Option<&String>) -> Result<Option<String>> {
        match stored {
            Some(text) => Ok(Some(self.decrypt(text)?)),
            None => Ok(None),
        }
    }

    /// Decrypts a value that may predate encryption. Legacy plaintext is
    /// returned as-is; the migration re-encrypts such rows on startup.
    pub fn decrypt_compat(&self, stored: &str) -> Result<String> {
        if is_encrypted(stored) {
            self.decrypt(stored)
        } else {
            Ok(stored.to_string())
        }
    }

    /// Generate a new 256-bit key, base64-encoded for environment variables.
    pub fn generate_key() -> String {
        let mut key_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key_bytes);
        BASE64.encode(key_bytes)
    }
}

/// Format check used by the plaintext-migration pass: a stored value is
/// considered encrypted iff it carries the versioned prefix and the payload
/// decodes to at least nonce + tag length.
pub fn is_encrypted(stored: &str) -> bool {
    stored
        .strip_prefix(CIPHERTEXT_PREFIX)
        .and_then(|encoded| BASE64.decode(encoded).ok())
        .map(|combined| combined.len() >= 28)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encryption_decryption() {
        let key = EncryptionService::generate_key();
        let service = EncryptionService::new(&key).unwrap();

        let plaintext = "sk-session-credential";
        let ciphertext = service.encrypt(plaintext).unwrap();
        let decrypted = service.decrypt(&ciphertext).unwrap();

        assert_eq!(plaintext, decrypted);
        assert_ne!(plaintext, ciphertext);
        assert!(ciphertext.starts_with("enc:v1:"));
    }

    #[test]
    fn test_empty_string() {
        let key = EncryptionService::generate_key();
        let service = EncryptionService::new(&key).unwrap();

        let ciphertext = service.encrypt("").unwrap();
        let decrypted = service.decrypt(&ciphertext).unwrap();

        assert_eq!("", decrypted);
    }

    #[test]
    fn test_unique_nonces() {
        let key = EncryptionService::generate_key();
        let service = EncryptionService::new(&key).unwrap();

        let plaintext = "same data";
        let ct1 = service.encrypt(plaintext).unwrap();
        let ct2 = service.encrypt(plaintext).unwrap();

        // Same plaintext must produce different ciphertexts (different nonces)
        assert_ne!(ct1, ct2);
        assert_eq!(service.decrypt(&ct1).unwrap(), plaintext);
        assert_eq!(service.decrypt(&ct2).unwrap(), plaintext);
    }

    #[test]
    fn test_tampered_ciphertext() {
        let key = EncryptionService::generate_key();
        let service = EncryptionService::new(&key).unwrap();

        let mut ciphertext = service.encrypt("sensitive data").unwrap();
        ciphertext.push('X');

        assert!(service.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_is_encrypted_detection() {
        let key = EncryptionService::generate_key();
        let service = EncryptionService::new(&key).unwrap();

        let ciphertext = service.encrypt("cookie-jar").unwrap();
        assert!(is_encrypted(&ciphertext));

        // Legacy plaintext forms the migration must catch
        assert!(!is_encrypted("sk-plaintext-token"));
        assert!(!is_encrypted(""));
        assert!(!is_encrypted("enc:v1:not-base64!!"));
        assert!(!is_encrypted("enc:v1:YWJj")); // too short to hold nonce + tag
    }

    #[test]
    fn test_decrypt_compat_passes_plaintext_through() {
        let key = EncryptionService::generate_key();
        let service = EncryptionService::new(&key).unwrap();

        assert_eq!(
            service.decrypt_compat("legacy-plaintext").unwrap(),
            "legacy-plaintext"
        );

        let ciphertext = service.encrypt("modern").unwrap();
        assert_eq!(service.decrypt_compat(&ciphertext).unwrap(), "modern");
    }

    #[test]
    fn test_invalid_key_rejected() {
        assert!(EncryptionService::new("dG9vc2hvcnQ=").is_err());
        assert!(EncryptionService::new("not base64 at all").is_err());
    }
}
