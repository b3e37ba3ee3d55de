//! AES-GCM encryption for credential data at rest.
//!
//! AES-256-GCM authenticated encryption; the random 96-bit nonce is
//! prepended to the ciphertext. Keys are carried base64-encoded.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::Rng;

use crate::error::{StoreError, StoreResult};

/// Nonce size for AES-GCM (96 bits).
const NONCE_SIZE: usize = 12;

/// Key size for AES-256 (256 bits).
const KEY_SIZE: usize = 32;

/// Encryptor for credential payloads.
#[derive(Clone)]
pub struct Encryptor {
    cipher: Aes256Gcm,
}

impl Encryptor {
    /// Create an encryptor from a base64-encoded 32-byte key.
    pub fn from_base64(key_base64: &str) -> StoreResult<Self> {
        let key_bytes = BASE64
            .decode(key_base64)
            .map_err(|e| StoreError::Encryption(format!("Invalid base64 key: {}", e)))?;
        Self::from_bytes(&key_bytes)
    }

    /// Create an encryptor from raw key bytes.
    pub fn from_bytes(key_bytes: &[u8]) -> StoreResult<Self> {
        if key_bytes.len() != KEY_SIZE {
            return Err(StoreError::Encryption(format!(
                "Invalid key length: expected {} bytes, got {}",
                KEY_SIZE,
                key_bytes.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(key_bytes)
            .map_err(|e| StoreError::Encryption(format!("Failed to create cipher: {}", e)))?;

        Ok(Self { cipher })
    }

    /// Generate a random key as base64.
    pub fn generate_key_base64() -> String {
        let mut key = vec![0u8; KEY_SIZE];
        rand::thread_rng().fill(&mut key[..]);
        BASE64.encode(key)
    }

    /// Encrypt; the nonce is prepended to the returned ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> StoreResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| StoreError::Encryption(format!("Encryption failed: {}", e)))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt data carrying a prepended nonce.
    pub fn decrypt(&self, ciphertext_with_nonce: &[u8]) -> StoreResult<Vec<u8>> {
        if ciphertext_with_nonce.len() < NONCE_SIZE {
            return Err(StoreError::Encryption(
                "Ciphertext too short (missing nonce)".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = ciphertext_with_nonce.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| StoreError::Encryption(format!("Decryption failed: {}", e)))
    }

    /// Encrypt a JSON value.
    pub fn encrypt_json(&self, data: &serde_json::Value) -> StoreResult<Vec<u8>> {
        let json_bytes = serde_json::to_vec(data)?;
        self.encrypt(&json_bytes)
    }

    /// Decrypt to a JSON value.
    pub fn decrypt_json(&self, ciphertext_with_nonce: &[u8]) -> StoreResult<serde_json::Value> {
        let plaintext = self.decrypt(ciphertext_with_nonce)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = Encryptor::generate_key_base64();
        let encryptor = Encryptor::from_base64(&key).unwrap();

        let plaintext = b"field map";
        let ciphertext = encryptor.encrypt(plaintext).unwrap();
        assert!(ciphertext.len() > plaintext.len());

        let decrypted = encryptor.decrypt(&ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_encrypt_decrypt_json() {
        let key = Encryptor::generate_key_base64();
        let encryptor = Encryptor::from_base64(&key).unwrap();

        let data = serde_json::json!({"user": "svc", "password": "secret123"});
        let ciphertext = encryptor.encrypt_json(&data).unwrap();
        assert_eq!(encryptor.decrypt_json(&ciphertext).unwrap(), data);
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(Encryptor::from_bytes(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let key = Encryptor::generate_key_base64();
        let encryptor = Encryptor::from_base64(&key).unwrap();

        let mut ciphertext = encryptor.encrypt(b"secret").unwrap();
        if let Some(byte) = ciphertext.last_mut() {
            *byte ^= 0xFF;
        }
        assert!(encryptor.decrypt(&ciphertext).is_err());
    }
}
