//! Multi-key, multi-scheme symmetric cipher suite.
//!
//! Two interoperable schemes are supported so that ciphertext produced by an
//! older deployment keeps decrypting after a scheme upgrade: `Aead`
//! (AES-256-GCM, with key rotation) and `Legacy` (a fixed-nonce
//! ChaCha20-Poly1305 token scheme, decrypt-only by default). A one-byte tag
//! prefixed to the ciphertext lets [`CipherSuite::decrypt`] pick the right
//! scheme without guessing.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce as AesNonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{ChaCha20Poly1305, Nonce as ChaChaNonce};
use rand::{rng, RngCore};

use crate::error::{Error, Result};

const TAG_AEAD: u8 = 0x01;
const TAG_LEGACY: u8 = 0x02;
const AES_NONCE_LEN: usize = 12;
const LEGACY_NONCE: [u8; 12] = *b"xcp-legacy01";

/// A single symmetric key, 32 bytes (256 bits), scheme-agnostic.
#[derive(Clone, Debug)]
pub struct CipherKey(pub [u8; 32]);

impl CipherKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Multi-key cipher suite. `aead_keys[0]` is the primary encrypt key; all
/// `aead_keys` and `legacy_keys` are trialled on decrypt, in declared order.
pub struct CipherSuite {
    aead_keys: Vec<CipherKey>,
    legacy_keys: Vec<CipherKey>,
}

impl CipherSuite {
    /// Build a suite from an ordered key ring. `aead_keys` must be
    /// non-empty; `legacy_keys` may be empty if no legacy ciphertext needs
    /// to be read.
    pub fn new(aead_keys: Vec<CipherKey>, legacy_keys: Vec<CipherKey>) -> Result<Self> {
        if aead_keys.is_empty() {
            return Err(Error::cipher("cipher suite requires at least one aead key"));
        }
        Ok(Self { aead_keys, legacy_keys })
    }

    /// Generate a fresh key suitable for either scheme.
    pub fn generate_key() -> CipherKey {
        CipherKey::generate()
    }

    /// Encrypt with the primary key, under the AEAD scheme.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let key = &self.aead_keys[0];
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| Error::cipher(format!("invalid key: {e}")))?;

        let mut nonce_bytes = [0u8; AES_NONCE_LEN];
        rng().fill_bytes(&mut nonce_bytes);
        let nonce = AesNonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| Error::cipher(format!("encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(1 + AES_NONCE_LEN + ciphertext.len());
        out.push(TAG_AEAD);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    /// Trial-decrypt, returning the plaintext on first matching key.
    pub fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let raw = STANDARD
            .decode(ciphertext)
            .map_err(|e| Error::cipher(format!("invalid ciphertext encoding: {e}")))?;
        let (tag, body) = raw.split_first().ok_or_else(|| Error::cipher("empty ciphertext"))?;

        match *tag {
            TAG_AEAD => self.decrypt_aead(body),
            TAG_LEGACY => self.decrypt_legacy(body),
            other => Err(Error::cipher(format!("unknown cipher scheme tag {other}"))),
        }
    }

    /// Same trial as [`Self::decrypt`] but returns only whether it would
    /// succeed.
    pub fn decryptable(&self, ciphertext: &str) -> bool {
        self.decrypt(ciphertext).is_ok()
    }

    /// A stable identity for this suite's key configuration, used as a
    /// discovery fingerprint input so that key rotation invalidates cached
    /// responses. Derived from key material, never from plaintext.
    pub fn identity(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        for key in &self.aead_keys {
            hasher.update(key.as_bytes());
        }
        hasher.update(b"|legacy|");
        for key in &self.legacy_keys {
            hasher.update(key.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    fn decrypt_aead(&self, body: &[u8]) -> Result<String> {
        if body.len() < AES_NONCE_LEN {
            return Err(Error::cipher("ciphertext too short"));
        }
        let (nonce_bytes, sealed) = body.split_at(AES_NONCE_LEN);
        let nonce = AesNonce::from_slice(nonce_bytes);

        for key in &self.aead_keys {
            let Ok(cipher) = Aes256Gcm::new_from_slice(key.as_bytes()) else {
                continue;
            };
            if let Ok(plaintext) = cipher.decrypt(nonce, sealed) {
                return String::from_utf8(plaintext)
                    .map_err(|e| Error::cipher(format!("non-utf8 plaintext: {e}")));
            }
        }
        Err(Error::cipher("no aead key could decrypt ciphertext"))
    }

    fn decrypt_legacy(&self, body: &[u8]) -> Result<String> {
        let nonce = ChaChaNonce::from_slice(&LEGACY_NONCE);
        for key in &self.legacy_keys {
            let Ok(cipher) = ChaCha20Poly1305::new_from_slice(key.as_bytes()) else {
                continue;
            };
            if let Ok(plaintext) = cipher.decrypt(nonce, body) {
                return String::from_utf8(plaintext)
                    .map_err(|e| Error::cipher(format!("non-utf8 plaintext: {e}")));
            }
        }
        Err(Error::cipher("no legacy key could decrypt ciphertext"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suite() -> CipherSuite {
        CipherSuite::new(vec![CipherKey::generate(), CipherKey::generate()], vec![]).unwrap()
    }

    #[test]
    fn round_trips_with_primary_key() {
        let suite = suite();
        let ct = suite.encrypt("s1").unwrap();
        assert_eq!(suite.decrypt(&ct).unwrap(), "s1");
        assert!(suite.decryptable(&ct));
    }

    #[test]
    fn rejects_garbage() {
        let suite = suite();
        assert!(suite.decrypt("not-base64!!").is_err());
        assert!(!suite.decryptable("not-base64!!"));
    }

    #[test]
    fn key_rotation_keeps_old_ciphertext_decryptable() {
        let k1 = CipherKey::generate();
        let k2 = CipherKey::generate();

        let old_suite = CipherSuite::new(vec![k2.clone()], vec![]).unwrap();
        let ct_under_k2 = old_suite.encrypt("s1").unwrap();

        // k1 is now primary, k2 retained for rotation.
        let new_suite = CipherSuite::new(vec![k1, k2], vec![]).unwrap();
        assert_eq!(new_suite.decrypt(&ct_under_k2).unwrap(), "s1");

        let ct_under_k1 = new_suite.encrypt("s2").unwrap();
        assert_eq!(new_suite.decrypt(&ct_under_k1).unwrap(), "s2");
    }
}
