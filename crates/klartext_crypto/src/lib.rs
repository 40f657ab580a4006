//! Field-level authenticated encryption.
//!
//! Sensitive columns (document bytes, step input/output text) are stored
//! as an opaque envelope: `[version:1][nonce:12][ciphertext+tag]` under
//! AES-256-GCM with a fresh random nonce per encryption. The store has
//! no knowledge of the scheme; a decryption failure is always surfaced,
//! never papered over with plaintext of suspect provenance.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Envelope format version. Bumped on any layout change.
const ENVELOPE_VERSION: u8 = 0x01;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
/// Version byte + nonce + GCM tag.
const ENVELOPE_OVERHEAD: usize = 1 + NONCE_LEN + 16;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The key material could not be loaded.
    #[error("invalid encryption key: {0}")]
    KeyFormat(String),

    /// Encryption failed (should not happen with a valid key).
    #[error("encryption failed")]
    Encrypt,

    /// The envelope is malformed or the ciphertext failed authentication.
    #[error("decryption failed: {0}")]
    Decrypt(&'static str),
}

/// AES-256-GCM cipher for sensitive columns.
///
/// Cloning is cheap enough for per-store handles; the schedule is shared
/// behind the aes-gcm internals.
#[derive(Clone)]
pub struct FieldCipher {
    cipher: Aes256Gcm,
    fingerprint: String,
}

impl FieldCipher {
    /// Load the key from its base64 encoding (the `KLARTEXT_ENCRYPTION_KEY`
    /// format). The decoded value must be exactly 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let decoded = Zeroizing::new(
            B64.decode(encoded.trim())
                .map_err(|e| CryptoError::KeyFormat(format!("not valid base64: {e}")))?,
        );
        if decoded.len() != KEY_LEN {
            return Err(CryptoError::KeyFormat(format!(
                "expected {KEY_LEN} key bytes, got {}",
                decoded.len()
            )));
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&decoded);
        Ok(Self::from_key_bytes(&key))
    }

    pub fn from_key_bytes(key: &[u8; KEY_LEN]) -> Self {
        let fingerprint = fingerprint(key);
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            fingerprint,
        }
    }

    /// Generate a fresh key; returns the cipher and the base64 encoding
    /// for the operator to store.
    pub fn generate() -> (Self, String) {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        rand::rngs::OsRng.fill_bytes(&mut key[..]);
        let encoded = B64.encode(&key[..]);
        (Self::from_key_bytes(&key), encoded)
    }

    /// First 8 hex chars of SHA-256 over the key. Safe to log.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Encrypt a sensitive value into an opaque envelope.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut envelope = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        envelope.push(ENVELOPE_VERSION);
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&ciphertext);
        Ok(envelope)
    }

    /// Decrypt an envelope produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if envelope.len() < ENVELOPE_OVERHEAD {
            return Err(CryptoError::Decrypt("envelope too short"));
        }
        if envelope[0] != ENVELOPE_VERSION {
            return Err(CryptoError::Decrypt("unknown envelope version"));
        }
        let nonce = Nonce::from_slice(&envelope[1..1 + NONCE_LEN]);
        self.cipher
            .decrypt(nonce, &envelope[1 + NONCE_LEN..])
            .map_err(|_| CryptoError::Decrypt("authentication failed"))
    }

    /// Encrypt a UTF-8 string field.
    pub fn encrypt_str(&self, plaintext: &str) -> Result<Vec<u8>, CryptoError> {
        self.encrypt(plaintext.as_bytes())
    }

    /// Decrypt into a UTF-8 string field.
    pub fn decrypt_str(&self, envelope: &[u8]) -> Result<String, CryptoError> {
        let bytes = self.decrypt(envelope)?;
        String::from_utf8(bytes).map_err(|_| CryptoError::Decrypt("plaintext is not UTF-8"))
    }
}

// Key material must never reach the logs.
impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

fn fingerprint(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> FieldCipher {
        FieldCipher::from_key_bytes(&[7u8; KEY_LEN])
    }

    #[test]
    fn round_trip() {
        let c = cipher();
        let envelope = c.encrypt(b"Patient: Maxime Musterfrau").unwrap();
        assert_eq!(c.decrypt(&envelope).unwrap(), b"Patient: Maxime Musterfrau");
    }

    #[test]
    fn envelope_is_opaque_and_versioned() {
        let c = cipher();
        let envelope = c.encrypt(b"hello").unwrap();
        assert_eq!(envelope[0], ENVELOPE_VERSION);
        assert_eq!(envelope.len(), b"hello".len() + ENVELOPE_OVERHEAD);
        // Plaintext must not appear verbatim.
        assert!(!envelope.windows(5).any(|w| w == b"hello"));
    }

    #[test]
    fn fresh_nonce_per_encryption() {
        let c = cipher();
        let a = c.encrypt(b"same input").unwrap();
        let b = c.encrypt(b"same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tamper_detected() {
        let c = cipher();
        let mut envelope = c.encrypt(b"payload").unwrap();
        let last = envelope.len() - 1;
        envelope[last] ^= 0x01;
        assert!(matches!(c.decrypt(&envelope), Err(CryptoError::Decrypt(_))));
    }

    #[test]
    fn wrong_key_rejected() {
        let a = FieldCipher::from_key_bytes(&[1u8; KEY_LEN]);
        let b = FieldCipher::from_key_bytes(&[2u8; KEY_LEN]);
        let envelope = a.encrypt(b"secret").unwrap();
        assert!(matches!(b.decrypt(&envelope), Err(CryptoError::Decrypt(_))));
    }

    #[test]
    fn short_and_misversioned_envelopes_rejected() {
        let c = cipher();
        assert!(c.decrypt(b"").is_err());
        assert!(c.decrypt(&[ENVELOPE_VERSION; 8]).is_err());

        let mut envelope = c.encrypt(b"x").unwrap();
        envelope[0] = 0x7f;
        assert!(matches!(
            c.decrypt(&envelope),
            Err(CryptoError::Decrypt("unknown envelope version"))
        ));
    }

    #[test]
    fn base64_key_loading() {
        let (_, encoded) = FieldCipher::generate();
        let c = FieldCipher::from_base64(&encoded).unwrap();
        let roundtrip = c.decrypt(&c.encrypt(b"ok").unwrap()).unwrap();
        assert_eq!(roundtrip, b"ok");

        assert!(FieldCipher::from_base64("!!!").is_err());
        assert!(FieldCipher::from_base64(&B64.encode([0u8; 16])).is_err());
    }

    #[test]
    fn debug_hides_key_material() {
        let c = cipher();
        let rendered = format!("{c:?}");
        assert!(rendered.contains(c.fingerprint()));
        assert!(!rendered.contains("cipher"));
    }
}
