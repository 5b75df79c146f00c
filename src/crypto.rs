//! At-rest encryption for OAuth tokens.
//!
//! AES-256-GCM keyed by the SHA-256 digest of the process-wide secret. The
//! stored form is `base64(nonce || ciphertext)`, so a fresh nonce travels with
//! every value.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha2::{Digest, Sha256};

const NONCE_SIZE: usize = 12;
pub const MIN_SECRET_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption key must be at least {MIN_SECRET_LEN} characters")]
    WeakSecret,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed (wrong key or corrupted data)")]
    Decrypt,
    #[error("invalid ciphertext: {0}")]
    InvalidFormat(String),
}

#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    pub fn new(secret: &str) -> Result<Self, CryptoError> {
        if secret.chars().count() < MIN_SECRET_LEN {
            return Err(CryptoError::WeakSecret);
        }
        let key: [u8; 32] = Sha256::digest(secret.as_bytes()).into();
        Ok(Self {
            cipher: Aes256Gcm::new(&key.into()),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        use rand::Rng;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(combined))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CryptoError> {
        let combined = BASE64
            .decode(encoded)
            .map_err(|err| CryptoError::InvalidFormat(err.to_string()))?;
        if combined.len() < NONCE_SIZE {
            return Err(CryptoError::InvalidFormat(format!(
                "{} bytes is shorter than a nonce",
                combined.len()
            )));
        }
        let (nonce, ciphertext) = combined.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::Decrypt)
    }
}
