use aes_gcm::aead::{Aead, KeyInit, OsRng, rand_core::RngCore};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

const NONCE_LEN: usize = 12;
const TAG_V1: u8 = 1;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),
    #[error("ciphertext is malformed or was tampered with")]
    Tamper,
    #[error("ciphertext uses an unsupported envelope version {0}")]
    UnsupportedVersion(u8),
}

/// Encrypts and decrypts short credential strings (API keys, webhook
/// secrets) for storage at rest. Ciphertext is self-describing: a version
/// byte, the random nonce, then the AES-256-GCM ciphertext+tag, all
/// base64-encoded — so a future key rotation can introduce a new version
/// byte without a schema change.
#[derive(Clone)]
pub struct FieldEncryptor {
    cipher: Aes256Gcm,
}

impl FieldEncryptor {
    /// `key_material` must decode (as base64 or hex) to exactly 32 bytes.
    pub fn new(key_material: &str) -> Result<Self, CryptoError> {
        let key_bytes = decode_key(key_material)?;
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Tamper)?;

        let mut envelope = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        envelope.push(TAG_V1);
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(envelope))
    }

    pub fn decrypt(&self, opaque: &str) -> Result<String, CryptoError> {
        let envelope = BASE64.decode(opaque).map_err(|_| CryptoError::Tamper)?;
        if envelope.len() < 1 + NONCE_LEN {
            return Err(CryptoError::Tamper);
        }

        let version = envelope[0];
        if version != TAG_V1 {
            return Err(CryptoError::UnsupportedVersion(version));
        }

        let nonce = Nonce::from_slice(&envelope[1..1 + NONCE_LEN]);
        let ciphertext = &envelope[1 + NONCE_LEN..];

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::Tamper)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::Tamper)
    }
}

fn decode_key(key_material: &str) -> Result<Vec<u8>, CryptoError> {
    let trimmed = key_material.trim();
    let decoded = BASE64
        .decode(trimmed)
        .or_else(|_| hex::decode(trimmed))
        .map_err(|_| {
            CryptoError::InvalidKey("key must be base64 or hex encoded".to_string())
        })?;

    if decoded.len() != 32 {
        return Err(CryptoError::InvalidKey(format!(
            "key must decode to 32 bytes, got {}",
            decoded.len()
        )));
    }

    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> String {
        BASE64.encode([7u8; 32])
    }

    #[test]
    fn test_round_trip() {
        let enc = FieldEncryptor::new(&test_key()).unwrap();
        let ciphertext = enc.encrypt("sk-live-abc123").unwrap();
        assert_eq!(enc.decrypt(&ciphertext).unwrap(), "sk-live-abc123");
    }

    #[test]
    fn test_ciphertext_differs_each_call() {
        let enc = FieldEncryptor::new(&test_key()).unwrap();
        let a = enc.encrypt("same-plaintext").unwrap();
        let b = enc.encrypt("same-plaintext").unwrap();
        assert_ne!(a, b, "nonce reuse would make ciphertexts identical");
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let enc = FieldEncryptor::new(&test_key()).unwrap();
        let mut ciphertext = BASE64.decode(enc.encrypt("secret").unwrap()).unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        let tampered = BASE64.encode(ciphertext);
        assert!(enc.decrypt(&tampered).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let enc_a = FieldEncryptor::new(&test_key()).unwrap();
        let enc_b = FieldEncryptor::new(&BASE64.encode([9u8; 32])).unwrap();
        let ciphertext = enc_a.encrypt("secret").unwrap();
        assert!(enc_b.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_rejects_short_key() {
        assert!(FieldEncryptor::new(&BASE64.encode([1u8; 16])).is_err());
    }

    #[test]
    fn test_rejects_garbage_ciphertext() {
        let enc = FieldEncryptor::new(&test_key()).unwrap();
        assert!(enc.decrypt("not-base64!!!").is_err());
        assert!(enc.decrypt(&BASE64.encode(b"too short")).is_err());
    }

    #[test]
    fn test_accepts_hex_key() {
        let hex_key = hex::encode([3u8; 32]);
        assert!(FieldEncryptor::new(&hex_key).is_ok());
    }
}
