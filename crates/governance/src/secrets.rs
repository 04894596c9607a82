//! Encryption at rest for integration credentials.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};

use marketops_core::{Error, Result, ViolationKind};

const NONCE_LEN: usize = 12;

/// A secret value that is encrypted at rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    /// The encrypted data (base64 encoded).
    pub ciphertext: String,
    /// Nonce used for encryption (base64 encoded).
    pub nonce: String,
}

/// AES-256-GCM cipher. Every ciphertext is bound to caller-supplied
/// associated data, so a value sealed for one context fails to open in another.
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(&key.into()),
        }
    }

    /// Key from a base64-encoded 32-byte value.
    pub fn from_base64(key: &Secret<String>) -> Result<Self> {
        let bytes = BASE64
            .decode(key.expose_secret().trim())
            .map_err(|e| Error::config(format!("Invalid encryption key encoding: {}", e)))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::config("Encryption key must be 32 bytes"))?;
        Ok(Self::new(key))
    }

    /// Cipher with a fresh random key. Ciphertexts do not survive a restart.
    pub fn ephemeral() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self::new(key)
    }

    /// Configured key, or an ephemeral one with a warning.
    pub fn from_config(key: Option<&Secret<String>>) -> Result<Self> {
        match key {
            Some(key) => Self::from_base64(key),
            None => {
                tracing::warn!("No encryption key configured; stored credentials will not survive a restart");
                Ok(Self::ephemeral())
            }
        }
    }

    pub fn encrypt(&self, plaintext: &Secret<String>, aad: &str) -> Result<EncryptedSecret> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext.expose_secret().as_bytes(),
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|e| Error::internal(format!("Encryption failed: {}", e)))?;

        Ok(EncryptedSecret {
            ciphertext: BASE64.encode(ciphertext),
            nonce: BASE64.encode(nonce_bytes),
        })
    }

    pub fn decrypt(&self, secret: &EncryptedSecret, aad: &str) -> Result<Secret<String>> {
        let nonce_bytes = BASE64
            .decode(&secret.nonce)
            .map_err(|e| integrity(format!("Invalid nonce: {}", e)))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(integrity("Invalid nonce length"));
        }
        let ciphertext = BASE64
            .decode(&secret.ciphertext)
            .map_err(|e| integrity(format!("Invalid ciphertext: {}", e)))?;

        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &ciphertext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| integrity("Decryption failed"))?;

        String::from_utf8(plaintext)
            .map(Secret::new)
            .map_err(|e| integrity(format!("Invalid UTF-8: {}", e)))
    }
}

fn integrity(msg: impl Into<String>) -> Error {
    Error::security(ViolationKind::Integrity, msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(s: &str) -> Secret<String> {
        Secret::new(s.to_string())
    }

    #[test]
    fn test_open_with_matching_context() {
        let cipher = SecretCipher::new([7u8; 32]);
        let sealed = cipher.encrypt(&secret("ya29.token"), "org_a:google_ads").unwrap();
        assert!(!sealed.ciphertext.contains("ya29"));

        let opened = cipher.decrypt(&sealed, "org_a:google_ads").unwrap();
        assert_eq!(opened.expose_secret(), "ya29.token");
    }

    #[test]
    fn test_other_context_fails_integrity() {
        let cipher = SecretCipher::new([7u8; 32]);
        let sealed = cipher.encrypt(&secret("ya29.token"), "org_a:google_ads").unwrap();

        let err = cipher.decrypt(&sealed, "org_b:google_ads").unwrap_err();
        assert_eq!(err.violation(), Some(ViolationKind::Integrity));

        let other_key = SecretCipher::new([8u8; 32]);
        assert!(other_key.decrypt(&sealed, "org_a:google_ads").is_err());
    }

    #[test]
    fn test_key_parsing() {
        let key = secret(&BASE64.encode([1u8; 32]));
        assert!(SecretCipher::from_base64(&key).is_ok());

        let short = secret(&BASE64.encode([1u8; 16]));
        assert!(matches!(SecretCipher::from_base64(&short), Err(Error::Config(_))));
        assert!(SecretCipher::from_base64(&secret("not base64!")).is_err());
    }

    #[test]
    fn test_nonces_are_fresh() {
        let cipher = SecretCipher::ephemeral();
        let a = cipher.encrypt(&secret("same"), "ctx").unwrap();
        let b = cipher.encrypt(&secret("same"), "ctx").unwrap();
        assert_ne!(a, b);
    }
}
