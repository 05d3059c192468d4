//! Authenticated encryption engine.
//!
//! Supports AES-256-GCM (default) and XChaCha20-Poly1305. The engine is a
//! pure function of its inputs: it holds no state and persists nothing, so a
//! single instance can be shared freely across threads.

use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, KeyInit, Payload},
    XChaCha20Poly1305,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::keys::{DataKey, KEY_LENGTH};
use keyledger_common::{Error, KeyId, Result};

/// Authentication tag size (16 bytes) for both algorithms.
pub const TAG_SIZE: usize = 16;

/// Current envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;

/// Supported AEAD algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "AES-256-GCM")]
    Aes256Gcm,
    #[serde(rename = "XChaCha20-Poly1305")]
    XChaCha20Poly1305,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Aes256Gcm => "AES-256-GCM",
            Algorithm::XChaCha20Poly1305 => "XChaCha20-Poly1305",
        }
    }

    /// IV (nonce) length in bytes.
    pub fn iv_len(&self) -> usize {
        match self {
            Algorithm::Aes256Gcm => 12,
            Algorithm::XChaCha20Poly1305 => 24,
        }
    }

    /// Key length in bits.
    pub fn key_bits(&self) -> u32 {
        (KEY_LENGTH * 8) as u32
    }

    /// Check a configured key length (in bits) against this algorithm.
    pub fn validate_key_length(&self, bits: u32) -> Result<()> {
        if bits != self.key_bits() {
            return Err(Error::InvalidInput(format!(
                "{} requires a {}-bit key, got {}",
                self.as_str(),
                self.key_bits(),
                bits
            )));
        }
        Ok(())
    }
}

impl Default for Algorithm {
    fn default() -> Self {
        Algorithm::Aes256Gcm
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "aes-256-gcm" | "aes256gcm" => Ok(Algorithm::Aes256Gcm),
            "xchacha20-poly1305" | "xchacha20poly1305" => Ok(Algorithm::XChaCha20Poly1305),
            other => Err(Error::InvalidInput(format!(
                "Unsupported algorithm: {}",
                other
            ))),
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Encrypted payload with everything needed to select the key and decrypt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u8,
    pub algorithm: Algorithm,
    pub key_id: KeyId,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub tag: Vec<u8>,
}

impl Envelope {
    /// Serialize to JSON bytes for the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Parse an envelope from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Stateless AEAD engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncryptionEngine;

impl EncryptionEngine {
    pub fn new() -> Self {
        Self
    }

    /// Encrypt plaintext under `key` with a random IV.
    ///
    /// # Postconditions
    /// - The envelope records the algorithm and key id of `key`
    /// - The key id is authenticated as associated data
    ///
    /// # Errors
    /// - Returns `Crypto` if the cipher rejects the input
    pub fn encrypt(&self, plaintext: &[u8], key: &DataKey) -> Result<Envelope> {
        let mut iv = vec![0u8; key.algorithm().iv_len()];
        rand::thread_rng().fill_bytes(&mut iv);
        self.encrypt_with_iv(plaintext, key, &iv)
    }

    /// Encrypt plaintext with a caller-supplied IV.
    ///
    /// # Warning
    /// Only for deterministic test vectors. Reusing an IV under the same key
    /// breaks confidentiality.
    pub fn encrypt_with_iv(&self, plaintext: &[u8], key: &DataKey, iv: &[u8]) -> Result<Envelope> {
        let algorithm = key.algorithm();
        if iv.len() != algorithm.iv_len() {
            return Err(Error::InvalidInput(format!(
                "{} requires a {}-byte IV, got {}",
                algorithm,
                algorithm.iv_len(),
                iv.len()
            )));
        }

        let payload = Payload {
            msg: plaintext,
            aad: key.id().as_str().as_bytes(),
        };
        let key_bytes = GenericArray::from_slice(key.material().as_bytes());

        let mut sealed = match algorithm {
            Algorithm::Aes256Gcm => {
                Aes256Gcm::new(key_bytes).encrypt(GenericArray::from_slice(iv), payload)
            }
            Algorithm::XChaCha20Poly1305 => {
                XChaCha20Poly1305::new(key_bytes).encrypt(GenericArray::from_slice(iv), payload)
            }
        }
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

        // The cipher returns ciphertext || tag.
        let tag = sealed.split_off(sealed.len() - TAG_SIZE);

        Ok(Envelope {
            version: ENVELOPE_VERSION,
            algorithm,
            key_id: key.id().clone(),
            iv: iv.to_vec(),
            ciphertext: sealed,
            tag,
        })
    }

    /// Decrypt an envelope with `key`.
    ///
    /// # Errors
    /// - Returns `DecryptionFailed` for every failure: wrong key, tampered
    ///   ciphertext, relabelled key id, mismatched algorithm or malformed
    ///   envelope all look the same to the caller
    pub fn decrypt(&self, envelope: &Envelope, key: &DataKey) -> Result<Vec<u8>> {
        let algorithm = key.algorithm();
        if envelope.version != ENVELOPE_VERSION
            || envelope.algorithm != algorithm
            || envelope.iv.len() != algorithm.iv_len()
            || envelope.tag.len() != TAG_SIZE
        {
            return Err(Error::DecryptionFailed);
        }

        let mut sealed = Vec::with_capacity(envelope.ciphertext.len() + TAG_SIZE);
        sealed.extend_from_slice(&envelope.ciphertext);
        sealed.extend_from_slice(&envelope.tag);

        let payload = Payload {
            msg: &sealed,
            aad: envelope.key_id.as_str().as_bytes(),
        };
        let key_bytes = GenericArray::from_slice(key.material().as_bytes());
        let iv = envelope.iv.as_slice();

        match algorithm {
            Algorithm::Aes256Gcm => {
                Aes256Gcm::new(key_bytes).decrypt(GenericArray::from_slice(iv), payload)
            }
            Algorithm::XChaCha20Poly1305 => {
                XChaCha20Poly1305::new(key_bytes).decrypt(GenericArray::from_slice(iv), payload)
            }
        }
        .map_err(|_| Error::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyMaterial;
    use proptest::prelude::*;

    fn data_key(id: &str, byte: u8, algorithm: Algorithm) -> DataKey {
        DataKey::new(
            KeyId::new(id).unwrap(),
            algorithm,
            KeyMaterial::from_bytes([byte; KEY_LENGTH]),
        )
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip_both_algorithms() {
        let engine = EncryptionEngine::new();
        for algorithm in [Algorithm::Aes256Gcm, Algorithm::XChaCha20Poly1305] {
            let key = data_key("key-1", 42, algorithm);
            let envelope = engine.encrypt(b"Hello, World!", &key).unwrap();

            assert_eq!(envelope.iv.len(), algorithm.iv_len());
            assert_eq!(envelope.tag.len(), TAG_SIZE);
            assert_eq!(envelope.ciphertext.len(), 13);
            assert_eq!(engine.decrypt(&envelope, &key).unwrap(), b"Hello, World!");
        }
    }

    #[test]
    fn test_different_iv_each_time() {
        let engine = EncryptionEngine::new();
        let key = data_key("key-1", 42, Algorithm::Aes256Gcm);

        let e1 = engine.encrypt(b"Same plaintext", &key).unwrap();
        let e2 = engine.encrypt(b"Same plaintext", &key).unwrap();

        assert_ne!(e1.iv, e2.iv);
        assert_ne!(e1.ciphertext, e2.ciphertext);
    }

    #[test]
    fn test_encrypt_with_iv_is_deterministic() {
        let engine = EncryptionEngine::new();
        let key = data_key("key-1", 42, Algorithm::XChaCha20Poly1305);
        let iv = [1u8; 24];

        let e1 = engine.encrypt_with_iv(b"Deterministic", &key, &iv).unwrap();
        let e2 = engine.encrypt_with_iv(b"Deterministic", &key, &iv).unwrap();

        assert_eq!(e1, e2);
        assert!(engine.encrypt_with_iv(b"x", &key, &[0u8; 12]).is_err());
    }

    #[test]
    fn test_wrong_key_is_uniform_failure() {
        let engine = EncryptionEngine::new();
        let k1 = data_key("key-1", 1, Algorithm::Aes256Gcm);
        let k2 = data_key("key-1", 2, Algorithm::Aes256Gcm);

        let envelope = engine.encrypt(b"Secret data", &k1).unwrap();
        let err = engine.decrypt(&envelope, &k2).unwrap_err();
        assert!(matches!(err, Error::DecryptionFailed));
    }

    #[test]
    fn test_tampered_ciphertext_is_uniform_failure() {
        let engine = EncryptionEngine::new();
        let key = data_key("key-1", 42, Algorithm::Aes256Gcm);

        let mut envelope = engine.encrypt(b"Important data", &key).unwrap();
        envelope.ciphertext[3] ^= 0xFF;

        let err = engine.decrypt(&envelope, &key).unwrap_err();
        assert_eq!(err.to_string(), Error::DecryptionFailed.to_string());
    }

    #[test]
    fn test_relabelled_key_id_fails() {
        let engine = EncryptionEngine::new();
        let key = data_key("key-1", 42, Algorithm::Aes256Gcm);

        let mut envelope = engine.encrypt(b"data", &key).unwrap();
        envelope.key_id = KeyId::new("key-2").unwrap();

        assert!(matches!(
            engine.decrypt(&envelope, &key),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn test_algorithm_mismatch_fails() {
        let engine = EncryptionEngine::new();
        let aes = data_key("key-1", 42, Algorithm::Aes256Gcm);
        let chacha = data_key("key-1", 42, Algorithm::XChaCha20Poly1305);

        let envelope = engine.encrypt(b"data", &aes).unwrap();
        assert!(matches!(
            engine.decrypt(&envelope, &chacha),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn test_empty_plaintext() {
        let engine = EncryptionEngine::new();
        let key = data_key("key-1", 42, Algorithm::Aes256Gcm);

        let envelope = engine.encrypt(b"", &key).unwrap();
        assert!(envelope.ciphertext.is_empty());
        assert_eq!(engine.decrypt(&envelope, &key).unwrap(), b"");
    }

    #[test]
    fn test_envelope_json_uses_base64() {
        let engine = EncryptionEngine::new();
        let key = data_key("key-1", 42, Algorithm::Aes256Gcm);
        let envelope = engine.encrypt(b"wire", &key).unwrap();

        let json: serde_json::Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(json["algorithm"], "AES-256-GCM");
        assert_eq!(json["key_id"], "key-1");
        assert!(json["iv"].is_string());

        let parsed = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_algorithm_parse_and_key_length() {
        assert_eq!("aes-256-gcm".parse::<Algorithm>().unwrap(), Algorithm::Aes256Gcm);
        assert_eq!(
            "XChaCha20-Poly1305".parse::<Algorithm>().unwrap(),
            Algorithm::XChaCha20Poly1305
        );
        assert!("des".parse::<Algorithm>().is_err());
        assert!(Algorithm::Aes256Gcm.validate_key_length(256).is_ok());
        assert!(Algorithm::Aes256Gcm.validate_key_length(128).is_err());
    }

    proptest! {
        #[test]
        fn prop_roundtrip(plaintext in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let engine = EncryptionEngine::new();
            let key = DataKey::new(KeyId::new("key-p").unwrap(), Algorithm::Aes256Gcm, KeyMaterial::generate());

            let envelope = engine.encrypt(&plaintext, &key).unwrap();
            prop_assert_eq!(engine.decrypt(&envelope, &key).unwrap(), plaintext);
        }

        #[test]
        fn prop_other_key_always_fails(plaintext in proptest::collection::vec(any::<u8>(), 0..1024)) {
            let engine = EncryptionEngine::new();
            let id = KeyId::new("key-p").unwrap();
            let k1 = DataKey::new(id.clone(), Algorithm::XChaCha20Poly1305, KeyMaterial::generate());
            let k2 = DataKey::new(id, Algorithm::XChaCha20Poly1305, KeyMaterial::generate());

            let envelope = engine.encrypt(&plaintext, &k1).unwrap();
            prop_assert!(matches!(engine.decrypt(&envelope, &k2), Err(Error::DecryptionFailed)));
        }

        #[test]
        fn prop_tamper_fails(
            plaintext in proptest::collection::vec(any::<u8>(), 1..1024),
            idx in 0usize..1024usize,
        ) {
            let engine = EncryptionEngine::new();
            let key = DataKey::new(KeyId::new("key-p").unwrap(), Algorithm::Aes256Gcm, KeyMaterial::generate());

            let mut envelope = engine.encrypt(&plaintext, &key).unwrap();
            let i = idx % envelope.ciphertext.len();
            envelope.ciphertext[i] ^= 0x01;
            prop_assert!(engine.decrypt(&envelope, &key).is_err());
        }
    }
}
