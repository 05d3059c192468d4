//! Passphrase to master key derivation (Argon2id, v0x13).

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};

use crate::keys::{MasterKey, Salt, KEY_LENGTH};
use keyledger_common::{Error, Result};

/// Argon2id cost settings. Stored next to the salt so a store keeps opening
/// with the settings it was created under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub lanes: u32,
}

impl KdfParams {
    /// 32 MiB, for hosts where the default is too heavy.
    pub fn low_memory() -> Self {
        Self {
            memory_kib: 32 * 1024,
            iterations: 3,
            lanes: 2,
        }
    }

    fn argon2(&self) -> Result<Argon2<'static>> {
        let params = Params::new(self.memory_kib, self.iterations, self.lanes, Some(KEY_LENGTH))
            .map_err(|e| Error::Config(format!("Invalid KDF parameters: {}", e)))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }

    pub fn validate(&self) -> Result<()> {
        self.argon2().map(|_| ())
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            lanes: 4,
        }
    }
}

/// Derive the master key for `passphrase` under `salt`.
pub fn derive_master_key(passphrase: &[u8], salt: &Salt, params: &KdfParams) -> Result<MasterKey> {
    if passphrase.is_empty() {
        return Err(Error::InvalidInput("Passphrase cannot be empty".to_string()));
    }

    let mut key = [0u8; KEY_LENGTH];
    params
        .argon2()?
        .hash_password_into(passphrase, salt.as_bytes(), &mut key)
        .map_err(|e| Error::Crypto(format!("Key derivation failed: {}", e)))?;

    Ok(MasterKey::from_bytes(key))
}
