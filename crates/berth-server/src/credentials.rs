// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! At-rest encryption for source-control credentials.
//!
//! Tokens are sealed with AES-256-GCM under a process-wide key and stored
//! as `base64(nonce || ciphertext)`. A fresh nonce is generated per
//! encryption, so the same token encrypts to different stored values.
//! Decrypted plaintext is handed out in a zeroize-on-drop buffer; the only
//! consumer is the dispatcher during job-payload assembly.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;
use zeroize::Zeroizing;

/// Nonce length AES-GCM prepends to the ciphertext.
const NONCE_LEN: usize = 12;

/// Credential cipher errors.
///
/// Decryption failures carry no detail; GCM reports nothing beyond "the
/// tag did not verify".
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The configured key is not 64 hex characters.
    #[error("Credential key must be 64 hex characters (32 bytes)")]
    InvalidKey,

    /// The stored value is not valid base64.
    #[error("Stored credential is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    /// The stored value is too short to carry a nonce.
    #[error("Stored credential is too short to carry a nonce")]
    Truncated,

    /// Encryption or decryption failed.
    #[error("Credential cipher failure; wrong key or corrupted ciphertext")]
    Cipher,
}

/// Process-wide credential cipher.
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

impl CredentialCipher {
    /// Build from a 64-hex-character key string.
    pub fn new(key_hex: &str) -> Result<Self, CredentialError> {
        let key = Zeroizing::new(
            hex::decode(key_hex.trim()).map_err(|_| CredentialError::InvalidKey)?,
        );
        if key.len() != 32 {
            return Err(CredentialError::InvalidKey);
        }
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CredentialError::InvalidKey)?;
        Ok(Self { cipher })
    }

    /// Seal a plaintext token for storage.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CredentialError::Cipher)?;
        let mut packed = Vec::with_capacity(NONCE_LEN + sealed.len());
        packed.extend_from_slice(&nonce);
        packed.extend_from_slice(&sealed);
        Ok(BASE64.encode(packed))
    }

    /// Open a stored token. The plaintext zeroizes on drop.
    pub fn decrypt(&self, stored: &str) -> Result<Zeroizing<String>, CredentialError> {
        let packed = BASE64.decode(stored.trim())?;
        if packed.len() <= NONCE_LEN {
            return Err(CredentialError::Truncated);
        }
        let (nonce, sealed) = packed.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CredentialError::Cipher)?;
        let text = String::from_utf8(plain).map_err(|_| CredentialError::Cipher)?;
        Ok(Zeroizing::new(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> String {
        "ab".repeat(32)
    }

    #[test]
    fn test_seal_and_open() {
        let cipher = CredentialCipher::new(&test_key()).unwrap();
        let stored = cipher.encrypt("ghp_example_token_123").unwrap();

        assert!(!stored.contains("ghp_example_token_123"));
        assert_eq!(cipher.decrypt(&stored).unwrap().as_str(), "ghp_example_token_123");
    }

    #[test]
    fn test_fresh_nonce_per_encryption() {
        let cipher = CredentialCipher::new(&test_key()).unwrap();
        let a = cipher.encrypt("tok").unwrap();
        let b = cipher.encrypt("tok").unwrap();

        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a).unwrap().as_str(), "tok");
        assert_eq!(cipher.decrypt(&b).unwrap().as_str(), "tok");
    }

    #[test]
    fn test_tampered_ciphertext_is_rejected() {
        let cipher = CredentialCipher::new(&test_key()).unwrap();
        let stored = cipher.encrypt("tok").unwrap();

        let mut bytes = BASE64.decode(&stored).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = BASE64.encode(bytes);

        assert!(matches!(
            cipher.decrypt(&tampered),
            Err(CredentialError::Cipher)
        ));
    }

    #[test]
    fn test_wrong_key_cannot_open() {
        let sealed_with = CredentialCipher::new(&test_key()).unwrap();
        let opened_with = CredentialCipher::new(&"cd".repeat(32)).unwrap();

        let stored = sealed_with.encrypt("tok").unwrap();
        assert!(matches!(
            opened_with.decrypt(&stored),
            Err(CredentialError::Cipher)
        ));
    }

    #[test]
    fn test_malformed_inputs() {
        let cipher = CredentialCipher::new(&test_key()).unwrap();

        assert!(matches!(
            cipher.decrypt("not base64!!!"),
            Err(CredentialError::Encoding(_))
        ));
        assert!(matches!(
            cipher.decrypt(&BASE64.encode([0u8; 8])),
            Err(CredentialError::Truncated)
        ));
    }

    #[test]
    fn test_key_validation() {
        assert!(matches!(
            CredentialCipher::new("deadbeef"),
            Err(CredentialError::InvalidKey)
        ));
        assert!(matches!(
            CredentialCipher::new(&"zz".repeat(32)),
            Err(CredentialError::InvalidKey)
        ));
    }

    #[test]
    fn test_debug_reveals_nothing() {
        let cipher = CredentialCipher::new(&test_key()).unwrap();
        let rendered = format!("{cipher:?}");
        assert!(!rendered.contains("ab"), "debug output leaked key material");
    }
}
