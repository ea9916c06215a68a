//! Encryption of stored broker passwords. Ciphertexts are persisted as
//! base64 of `nonce || ciphertext` under AES-256-GCM.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fmt;
use thiserror::Error;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Credential key must be {KEY_LEN} bytes of base64, got {0} bytes")]
    InvalidKeyLength(usize),
    #[error("Invalid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("Ciphertext too short")]
    Truncated,
    #[error("Failed to encrypt credential")]
    Encrypt,
    #[error("Failed to decrypt credential")]
    Decrypt,
    #[error("Decrypted credential is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialCipher(<redacted>)")
    }
}

impl CredentialCipher {
    pub fn from_base64_key(key: &str) -> Result<Self, CredentialError> {
        let bytes = STANDARD.decode(key.trim())?;
        if bytes.len() != KEY_LEN {
            return Err(CredentialError::InvalidKeyLength(bytes.len()));
        }

        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&bytes)),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| CredentialError::Encrypt)?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend(ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    pub fn decrypt(&self, sealed: &str) -> Result<String, CredentialError> {
        let sealed = STANDARD.decode(sealed)?;
        if sealed.len() <= NONCE_LEN {
            return Err(CredentialError::Truncated);
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CredentialError::Decrypt)?;

        Ok(String::from_utf8(plaintext)?)
    }
}
