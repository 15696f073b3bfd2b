//! Authenticated encryption for API key material at rest (spec §9
//! "Encryption-at-rest"). Uses AES-256-GCM from the RustCrypto `aes-gcm`
//! crate rather than inventing a construction. The key is a
//! process-wide secret loaded once at startup; it is never logged, and
//! neither plaintext nor ciphertext length is logged anywhere that
//! could correlate to plaintext entropy.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption key must be 32 bytes (64 hex chars)")]
    InvalidKeyLength,
    #[error("encryption key was not valid hex")]
    InvalidKeyEncoding,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed: ciphertext invalid or tampered")]
    DecryptionFailed,
    #[error("ciphertext too short to contain a nonce")]
    CiphertextTooShort,
    #[error("{0} is not set; required outside test mode (spec §6/§9)")]
    MissingEnvKey(&'static str),
}

const NONCE_LEN: usize = 12;

/// Environment variable holding the hex-encoded 32-byte process-wide
/// encryption key (spec §6 "encryption-key location (environment
/// only; required unless explicitly running in a test mode)").
pub const ENCRYPTION_KEY_ENV_VAR: &str = "APIKEYROUTER_ENCRYPTION_KEY";

/// Symmetric cipher keyed from a process-wide secret, required at
/// startup outside of test mode.
pub struct MaterialCipher {
    cipher: Aes256Gcm,
}

impl MaterialCipher {
    pub fn from_hex_key(hex_key: &str) -> Result<Self, CryptoError> {
        let bytes = hex_decode(hex_key).map_err(|_| CryptoError::InvalidKeyEncoding)?;
        Self::from_key_bytes(&bytes)
    }

    pub fn from_key_bytes(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != 32 {
            return Err(CryptoError::InvalidKeyLength);
        }
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self { cipher })
    }

    /// Loads the process-wide key from `APIKEYROUTER_ENCRYPTION_KEY`.
    /// Fails rather than falling back to a generated key: spec §9
    /// requires startup to fail if the key is absent outside test
    /// mode, and this is the only non-test-mode constructor.
    pub fn from_env() -> Result<Self, CryptoError> {
        let hex_key = std::env::var(ENCRYPTION_KEY_ENV_VAR).map_err(|_| CryptoError::MissingEnvKey(ENCRYPTION_KEY_ENV_VAR))?;
        Self::from_hex_key(&hex_key)
    }

    /// Generates a fresh random key, for test-mode operation only.
    pub fn generate_for_tests() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self::from_key_bytes(&key).expect("32-byte key is always valid")
    }

    /// Encrypts plaintext, returning `nonce || ciphertext_with_tag`.
    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptionFailed)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, blob: &[u8]) -> Result<String, CryptoError> {
        if blob.len() < NONCE_LEN {
            return Err(CryptoError::CiphertextTooShort);
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
    }
}

fn hex_decode(s: &str) -> Result<Vec<u8>, ()> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return Err(());
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let hi = hex_digit(bytes[i])?;
        let lo = hex_digit(bytes[i + 1])?;
        out.push((hi << 4) | lo);
        i += 2;
    }
    Ok(out)
}

fn hex_digit(b: u8) -> Result<u8, ()> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_material() {
        let cipher = MaterialCipher::generate_for_tests();
        let ciphertext = cipher.encrypt("sk-super-secret-material").unwrap();
        assert_ne!(ciphertext, b"sk-super-secret-material".to_vec());
        let plaintext = cipher.decrypt(&ciphertext).unwrap();
        assert_eq!(plaintext, "sk-super-secret-material");
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let cipher = MaterialCipher::generate_for_tests();
        let mut ciphertext = cipher.encrypt("sk-super-secret-material").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        assert!(cipher.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn rejects_wrong_key_length() {
        assert!(MaterialCipher::from_key_bytes(&[0u8; 16]).is_err());
    }

    #[test]
    fn from_env_fails_when_unset() {
        std::env::remove_var(ENCRYPTION_KEY_ENV_VAR);
        assert!(matches!(MaterialCipher::from_env(), Err(CryptoError::MissingEnvKey(_))));
    }

    #[test]
    fn hex_key_round_trip() {
        let hex_key = "00".repeat(32);
        let cipher = MaterialCipher::from_hex_key(&hex_key).unwrap();
        let ciphertext = cipher.encrypt("sk-abcdefghijklmno").unwrap();
        assert_eq!(cipher.decrypt(&ciphertext).unwrap(), "sk-abcdefghijklmno");
    }
}
