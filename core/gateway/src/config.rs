//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::policy::PolicyTable;
use keyledger_audit::AuditConfig;
use keyledger_common::{Error, Result, SensitiveBytes};
use keyledger_crypto::{KdfParams, MasterKey};
use keyledger_keys::KeyConfig;
use keyledger_ledger::LedgerConfig;
use keyledger_store::{KeyRepository, MemoryRepository, SqliteRepository, TransactionRepository};

/// Default environment variable holding the master key.
pub const DEFAULT_MASTER_KEY_VAR: &str = "KEYLEDGER_MASTER_KEY";

/// Backend for key and transaction records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    #[default]
    Memory,
    Sqlite {
        path: PathBuf,
    },
}

/// Both repositories, backed by the same store.
#[derive(Clone)]
pub struct Repositories {
    pub keys: Arc<dyn KeyRepository>,
    pub transactions: Arc<dyn TransactionRepository>,
}

impl StoreConfig {
    /// Open the configured backend.
    ///
    /// # Errors
    /// - `Storage` if the database cannot be opened
    pub fn open(&self) -> Result<Repositories> {
        match self {
            StoreConfig::Memory => {
                let repo = Arc::new(MemoryRepository::new());
                Ok(Repositories {
                    keys: repo.clone(),
                    transactions: repo,
                })
            }
            StoreConfig::Sqlite { path } => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                let repo = Arc::new(SqliteRepository::open(path)?);
                Ok(Repositories {
                    keys: repo.clone(),
                    transactions: repo,
                })
            }
        }
    }
}

/// Where the master key comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MasterKeySource {
    /// Base64-encoded raw key in an environment variable.
    Env { var: String },
    /// Passphrase in an environment variable, stretched with Argon2id.
    Passphrase {
        var: String,
        #[serde(default)]
        kdf: KdfParams,
    },
}

impl Default for MasterKeySource {
    fn default() -> Self {
        MasterKeySource::Env {
            var: DEFAULT_MASTER_KEY_VAR.to_string(),
        }
    }
}

/// Resolved master-key input.
pub enum MasterSecret {
    Key(MasterKey),
    Passphrase {
        passphrase: SensitiveBytes,
        kdf: KdfParams,
    },
}

impl MasterKeySource {
    pub fn var(&self) -> &str {
        match self {
            MasterKeySource::Env { var } | MasterKeySource::Passphrase { var, .. } => var,
        }
    }

    /// Read the secret from the environment.
    ///
    /// Returns `None` when the variable is unset.
    ///
    /// # Errors
    /// - `Config` if a raw key is not valid base64 of the right length
    pub fn from_env(&self) -> Result<Option<MasterSecret>> {
        let Ok(value) = std::env::var(self.var()) else {
            return Ok(None);
        };
        self.resolve(value).map(Some)
    }

    /// Turn a secret value obtained elsewhere (e.g. a prompt) into a
    /// [`MasterSecret`].
    pub fn resolve(&self, value: String) -> Result<MasterSecret> {
        match self {
            MasterKeySource::Env { var } => MasterKey::from_base64(value.trim())
                .map(MasterSecret::Key)
                .map_err(|e| Error::Config(format!("{} is not a valid master key: {}", var, e))),
            MasterKeySource::Passphrase { kdf, .. } => {
                if value.is_empty() {
                    return Err(Error::Config("master passphrase cannot be empty".to_string()));
                }
                Ok(MasterSecret::Passphrase {
                    passphrase: SensitiveBytes::new(value.into_bytes()),
                    kdf: kdf.clone(),
                })
            }
        }
    }
}

/// Complete engine configuration. All durations are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub key: KeyConfig,
    pub ledger: LedgerConfig,
    pub audit: AuditConfig,
    pub gateway: PolicyTable,
    pub store: StoreConfig,
    pub master_key: MasterKeySource,
    /// How often expiry and audit retention run.
    pub maintenance_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            key: KeyConfig::default(),
            ledger: LedgerConfig::default(),
            audit: AuditConfig::default(),
            gateway: PolicyTable::default(),
            store: StoreConfig::default(),
            master_key: MasterKeySource::default(),
            maintenance_interval_secs: 60 * 60,
        }
    }
}

impl EngineConfig {
    /// Load and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section for consistency.
    pub fn validate(&self) -> Result<()> {
        self.key.validate()?;
        self.ledger.validate()?;
        self.audit.validate()?;
        self.gateway.validate()?;
        if self.master_key.var().is_empty() {
            return Err(Error::Config(
                "master_key variable name cannot be empty".to_string(),
            ));
        }
        if let MasterKeySource::Passphrase { kdf, .. } = &self.master_key {
            kdf.validate()?;
        }
        if self.maintenance_interval_secs == 0 {
            return Err(Error::Config(
                "maintenance_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn maintenance_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.maintenance_interval_secs)
    }
}
