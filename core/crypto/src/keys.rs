//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::aead::Algorithm;
use keyledger_common::{Error, KeyId, Result};

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Master key that seals data-key material at rest.
///
/// Held outside the key store (environment or passphrase) and only ever
/// used inside the store accessor.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; KEY_LENGTH],
}

impl MasterKey {
    /// Create a master key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Decode a base64-encoded master key.
    ///
    /// # Errors
    /// - Returns error if the input is not base64
    /// - Returns error if the decoded length is not KEY_LENGTH
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let mut decoded = BASE64
            .decode(encoded.trim())
            .map_err(|_| Error::Config("Master key is not valid base64".to_string()))?;

        if decoded.len() != KEY_LENGTH {
            let len = decoded.len();
            decoded.zeroize();
            return Err(Error::Config(format!(
                "Master key must be {} bytes, got {}",
                KEY_LENGTH, len
            )));
        }

        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self { key })
    }

    /// Generate a random master key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    /// Encode the key as base64 for handing to a secret manager.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.key)
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKey([REDACTED])")
    }
}

/// Raw data-key material.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    key: [u8; KEY_LENGTH],
}

impl KeyMaterial {
    /// Create key material from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Create key material from a slice.
    ///
    /// # Errors
    /// - Returns error if the slice is not KEY_LENGTH bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_LENGTH {
            return Err(Error::Crypto(format!(
                "Invalid key length: expected {}, got {}",
                KEY_LENGTH,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    /// Generate random key material.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    /// Get the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Non-secret fingerprint for identifying material in metadata.
    ///
    /// BLAKE2b over a domain-separation label and the key, truncated to
    /// 8 bytes and hex encoded.
    pub fn fingerprint(&self) -> String {
        use blake2::digest::consts::U32;
        use blake2::{Blake2b, Digest};

        let mut hasher = Blake2b::<U32>::new();
        hasher.update(b"keyledger-fingerprint");
        hasher.update(self.key);
        let digest = hasher.finalize();

        digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial([REDACTED])")
    }
}

/// A data key captured for one or more crypto operations.
///
/// This is a value snapshot: once a transaction holds a `DataKey`, later
/// rotation or revocation of the stored key does not change it.
#[derive(Clone)]
pub struct DataKey {
    id: KeyId,
    algorithm: Algorithm,
    material: KeyMaterial,
}

impl DataKey {
    pub fn new(id: KeyId, algorithm: Algorithm, material: KeyMaterial) -> Self {
        Self {
            id,
            algorithm,
            material,
        }
    }

    pub fn id(&self) -> &KeyId {
        &self.id
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn material(&self) -> &KeyMaterial {
        &self.material
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataKey")
            .field("id", &self.id)
            .field("algorithm", &self.algorithm)
            .field("material", &"[REDACTED]")
            .finish()
    }
}

/// Salt for master-key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salt(pub [u8; 32]);

impl Salt {
    /// Generate a random salt.
    pub fn generate() -> Self {
        let mut salt = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt);
        Self(salt)
    }

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}
