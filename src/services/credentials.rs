//! Secrets at rest.
//!
//! Bind passwords and artifact payloads are sealed with AES-256-GCM under a
//! key derived from `security.encryption_key`. Sealed bytes are laid out as
//! `nonce (12 bytes) || ciphertext+tag`; the string form is that, base64.
//!
//! API keys are never stored: only their SHA-256 digest and a short display
//! prefix are persisted.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::constants::auth::{API_KEY_DISPLAY_PREFIX_LEN, API_KEY_PREFIX};

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;
const KEY_CONTEXT: &[u8] = b"ldapguard/secrets/aes-256-gcm/v1";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("encryption key must not be empty")]
    EmptyKey,

    #[error("sealed value is too short")]
    TooShort,

    #[error("sealed value is not valid base64")]
    Encoding,

    /// Wrong key or tampered ciphertext; AES-GCM cannot tell them apart.
    #[error("decryption failed")]
    DecryptionFailed,

    #[error("encryption failed")]
    EncryptionFailed,
}

/// Holds the derived key. Cheap to clone; read-only once built.
#[derive(Clone)]
pub struct CredentialStore {
    key: [u8; 32],
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore").finish_non_exhaustive()
    }
}

impl CredentialStore {
    pub fn from_secret(secret: &str) -> Result<Self, CredentialError> {
        if secret.is_empty() {
            return Err(CredentialError::EmptyKey);
        }
        let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
            .map_err(|_| CredentialError::EmptyKey)?;
        mac.update(KEY_CONTEXT);
        Ok(Self {
            key: mac.finalize().into_bytes().into(),
        })
    }

    fn cipher(&self) -> Result<Aes256Gcm, CredentialError> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|_| CredentialError::EncryptionFailed)
    }

    pub fn seal_bytes(&self, plaintext: &[u8]) -> Result<Vec<u8>, CredentialError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CredentialError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open_bytes(&self, sealed: &[u8]) -> Result<Vec<u8>, CredentialError> {
        if sealed.len() < NONCE_LEN + 16 {
            return Err(CredentialError::TooShort);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CredentialError::DecryptionFailed)
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, CredentialError> {
        Ok(STANDARD.encode(self.seal_bytes(plaintext.as_bytes())?))
    }

    pub fn open(&self, sealed: &str) -> Result<String, CredentialError> {
        let raw = STANDARD
            .decode(sealed)
            .map_err(|_| CredentialError::Encoding)?;
        let plain = self.open_bytes(&raw)?;
        String::from_utf8(plain).map_err(|_| CredentialError::Encoding)
    }
}

/// A fresh API key: `ldapg_` followed by 43 url-safe base64 characters.
#[must_use]
pub fn generate_api_key() -> String {
    let bytes: [u8; 32] = rand::random();
    format!("{API_KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// Hex SHA-256 digest, the only form of an API key that is persisted.
#[must_use]
pub fn hash_api_key(key: &str) -> String {
    hex_digest(key.as_bytes())
}

#[must_use]
pub fn api_key_display_prefix(key: &str) -> String {
    key.chars().take(API_KEY_DISPLAY_PREFIX_LEN).collect()
}

#[must_use]
pub fn hex_digest(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .fold(String::with_capacity(64), |mut acc, b| {
            use std::fmt::Write;
            let _ = write!(acc, "{b:02x}");
            acc
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip_and_nonce_is_random() {
        let store = CredentialStore::from_secret("unit-test-secret").unwrap();
        let a = store.seal("cn=admin secret").unwrap();
        let b = store.seal("cn=admin secret").unwrap();

        assert_ne!(a, b);
        assert_eq!(store.open(&a).unwrap(), "cn=admin secret");
    }

    #[test]
    fn test_wrong_key_and_tampering_are_rejected() {
        let store = CredentialStore::from_secret("one").unwrap();
        let other = CredentialStore::from_secret("two").unwrap();
        let mut sealed = store.seal_bytes(b"payload").unwrap();

        assert!(matches!(
            other.open_bytes(&sealed),
            Err(CredentialError::DecryptionFailed)
        ));

        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            store.open_bytes(&sealed),
            Err(CredentialError::DecryptionFailed)
        ));
        assert!(matches!(store.open_bytes(&[0; 4]), Err(CredentialError::TooShort)));
    }

    #[test]
    fn test_empty_secret_is_rejected() {
        assert!(matches!(
            CredentialStore::from_secret(""),
            Err(CredentialError::EmptyKey)
        ));
    }

    #[test]
    fn test_api_key_shape() {
        let key = generate_api_key();
        assert!(key.starts_with("ldapg_"));
        assert_eq!(key.len(), 6 + 43);
        assert_eq!(api_key_display_prefix(&key).len(), 10);
        assert_eq!(hash_api_key(&key).len(), 64);
        assert_ne!(hash_api_key(&key), hash_api_key(&generate_api_key()));
    }

    #[test]
    fn test_hex_digest_known_value() {
        assert_eq!(
            hex_digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
