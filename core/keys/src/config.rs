//! Key lifecycle configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use keyledger_common::{Error, Result};
use keyledger_crypto::Algorithm;

const DAY_SECS: u64 = 24 * 60 * 60;

/// Key lifecycle settings. All durations are in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// Algorithm for newly generated keys.
    pub algorithm: Algorithm,
    /// Key length in bits.
    pub key_length_bits: u32,
    /// Validity of a new key.
    pub key_lifetime_secs: u64,
    /// Rotate once remaining validity drops to this.
    pub rotation_threshold_secs: u64,
    /// How long a rotating key stays usable for decryption before expiry.
    pub rotation_grace_secs: u64,
    /// Active-key cache TTL. Zero disables caching.
    pub cache_ttl_secs: u64,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Aes256Gcm,
            key_length_bits: 256,
            key_lifetime_secs: 30 * DAY_SECS,
            rotation_threshold_secs: 7 * DAY_SECS,
            rotation_grace_secs: 7 * DAY_SECS,
            cache_ttl_secs: 30,
        }
    }
}

impl KeyConfig {
    /// Check the settings for consistency.
    ///
    /// # Errors
    /// - `Config` if the key length does not fit the algorithm
    /// - `Config` if the lifetime is zero or not longer than the rotation threshold
    pub fn validate(&self) -> Result<()> {
        self.algorithm
            .validate_key_length(self.key_length_bits)
            .map_err(|e| Error::Config(e.to_string()))?;

        if self.key_lifetime_secs == 0 {
            return Err(Error::Config("key_lifetime_secs must be positive".to_string()));
        }
        if self.rotation_threshold_secs >= self.key_lifetime_secs {
            return Err(Error::Config(format!(
                "rotation_threshold_secs ({}) must be less than key_lifetime_secs ({})",
                self.rotation_threshold_secs, self.key_lifetime_secs
            )));
        }
        Ok(())
    }

    pub fn key_lifetime(&self) -> Duration {
        secs(self.key_lifetime_secs)
    }

    pub fn rotation_threshold(&self) -> Duration {
        secs(self.rotation_threshold_secs)
    }

    pub fn rotation_grace(&self) -> Duration {
        secs(self.rotation_grace_secs)
    }

    pub fn cache_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cache_ttl_secs)
    }
}

fn secs(value: u64) -> Duration {
    // chrono durations top out at i64::MAX milliseconds.
    Duration::seconds(value.min(i64::MAX as u64 / 1_000) as i64)
}
