//! Ledger configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use keyledger_common::{Error, Result};

/// Ledger settings. All durations are in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Pending transactions older than this are failed by the reaper.
    pub transaction_timeout_secs: u64,
    /// How often the reaper sweeps.
    pub reaper_interval_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            transaction_timeout_secs: 30 * 60,
            reaper_interval_secs: 60,
        }
    }
}

impl LedgerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.transaction_timeout_secs == 0 {
            return Err(Error::Config(
                "transaction_timeout_secs must be positive".to_string(),
            ));
        }
        if self.reaper_interval_secs == 0 {
            return Err(Error::Config("reaper_interval_secs must be positive".to_string()));
        }
        Ok(())
    }

    pub fn transaction_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.transaction_timeout_secs.min(i64::MAX as u64 / 1_000) as i64)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}
