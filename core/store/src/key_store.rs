//! Sealing accessor over a [`KeyRepository`].
//!
//! `KeyStore` is the only place key material exists in plaintext: it seals
//! fresh material before it reaches the repository and opens sealed material
//! only to hand out a [`DataKey`].

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::records::{KeyRecord, KeyStatus};
use crate::repository::{KeyRepository, PredecessorUpdate};
use keyledger_common::{Error, KeyId, Result};
use keyledger_crypto::{
    derive_master_key, seal_material, unseal_material, verification_blob, verify_master_key,
    Algorithm, DataKey, KdfParams, KeyMaterial, MasterKey, Salt,
};

const META_MASTER_CHECK: &str = "master_key_check";
const META_KDF_SALT: &str = "kdf_salt";
const META_KDF_PARAMS: &str = "kdf_params";

/// Metadata key holding the non-secret fingerprint of a key's material.
pub const META_FINGERPRINT: &str = "fingerprint";

/// Key repository plus the master key that seals its material.
pub struct KeyStore {
    repo: Arc<dyn KeyRepository>,
    master: MasterKey,
}

impl KeyStore {
    /// Open a store with a raw master key.
    ///
    /// A fresh store records a verification blob; an existing one must match.
    ///
    /// # Errors
    /// - `NotPermitted` if the master key does not match the store
    pub async fn open(repo: Arc<dyn KeyRepository>, master: MasterKey) -> Result<Self> {
        match repo.get_meta(META_MASTER_CHECK).await? {
            Some(blob) => {
                if !verify_master_key(&master, &blob) {
                    return Err(Error::NotPermitted(
                        "master key does not match this store".to_string(),
                    ));
                }
                debug!(backend = repo.name(), "master key verified");
            }
            None => {
                repo.put_meta(META_MASTER_CHECK, verification_blob(&master)?)
                    .await?;
                info!(backend = repo.name(), "initialized master key check");
            }
        }

        Ok(Self { repo, master })
    }

    /// Open a store with a master key derived from a passphrase.
    ///
    /// The salt and KDF parameters are kept in store metadata; `params` only
    /// applies when the store has none yet.
    pub async fn open_with_passphrase(
        repo: Arc<dyn KeyRepository>,
        passphrase: &[u8],
        params: &KdfParams,
    ) -> Result<Self> {
        let salt = match repo.get_meta(META_KDF_SALT).await? {
            Some(raw) => serde_json::from_slice::<Salt>(&raw)
                .map_err(|e| Error::Serialization(e.to_string()))?,
            None => {
                let salt = Salt::generate();
                let raw =
                    serde_json::to_vec(&salt).map_err(|e| Error::Serialization(e.to_string()))?;
                repo.put_meta(META_KDF_SALT, raw).await?;
                salt
            }
        };

        let params = match repo.get_meta(META_KDF_PARAMS).await? {
            Some(raw) => serde_json::from_slice::<KdfParams>(&raw)
                .map_err(|e| Error::Serialization(e.to_string()))?,
            None => {
                let raw =
                    serde_json::to_vec(params).map_err(|e| Error::Serialization(e.to_string()))?;
                repo.put_meta(META_KDF_PARAMS, raw).await?;
                params.clone()
            }
        };

        let master = derive_master_key(passphrase, &salt, &params)?;
        Self::open(repo, master).await
    }

    pub fn repository(&self) -> &Arc<dyn KeyRepository> {
        &self.repo
    }

    /// Build a new active key record around freshly generated, sealed material.
    ///
    /// Nothing is persisted; pass the record to [`KeyStore::activate`].
    ///
    /// # Errors
    /// - `InvalidInput` if `key_length` does not fit `algorithm`
    pub fn new_record(
        &self,
        algorithm: Algorithm,
        key_length: u32,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<KeyRecord> {
        algorithm.validate_key_length(key_length)?;

        let id = KeyId::generate();
        let material = KeyMaterial::generate();
        let sealed_material = seal_material(&self.master, &id, &material)?;

        let mut metadata = BTreeMap::new();
        metadata.insert(META_FINGERPRINT.to_string(), material.fingerprint());

        Ok(KeyRecord {
            id,
            algorithm,
            key_length,
            sealed_material,
            status: KeyStatus::Active,
            version: 1,
            created_at,
            expires_at,
            rotated_at: None,
            revoked_at: None,
            expired_at: None,
            metadata,
        })
    }

    /// Open a record's material into a [`DataKey`] snapshot.
    ///
    /// # Errors
    /// - `Crypto` if the sealed material does not open under this master key
    pub fn data_key(&self, record: &KeyRecord) -> Result<DataKey> {
        let material = unseal_material(&self.master, &record.id, &record.sealed_material)?;
        Ok(DataKey::new(record.id.clone(), record.algorithm, material))
    }

    pub async fn activate(
        &self,
        record: KeyRecord,
        predecessor: Option<PredecessorUpdate>,
    ) -> Result<()> {
        self.repo.activate(record, predecessor).await
    }

    pub async fn get(&self, id: &KeyId) -> Result<Option<KeyRecord>> {
        self.repo.get_key(id).await
    }

    /// The single active key, if the store has been bootstrapped.
    ///
    /// # Errors
    /// - `NoActiveKey` if more than one key is marked active
    pub async fn active(&self) -> Result<Option<KeyRecord>> {
        let mut active = self.repo.active_keys().await?;
        match active.len() {
            0 => Ok(None),
            1 => Ok(active.pop()),
            n => Err(Error::NoActiveKey(format!(
                "{} keys are marked active",
                n
            ))),
        }
    }

    pub async fn list(&self) -> Result<Vec<KeyRecord>> {
        self.repo.list_keys().await
    }

    pub async fn update_status(
        &self,
        id: &KeyId,
        expected_version: u64,
        status: KeyStatus,
        at: DateTime<Utc>,
    ) -> Result<KeyRecord> {
        self.repo
            .update_key_status(id, expected_version, status, at)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRepository;
    use chrono::Duration;

    fn repo() -> Arc<dyn KeyRepository> {
        Arc::new(MemoryRepository::new())
    }

    fn fast_params() -> KdfParams {
        KdfParams {
            memory_kib: 1024,
            iterations: 1,
            lanes: 1,
        }
    }

    #[tokio::test]
    async fn test_new_record_seals_and_opens() {
        let store = KeyStore::open(repo(), MasterKey::generate()).await.unwrap();
        let now = Utc::now();
        let record = store
            .new_record(Algorithm::Aes256Gcm, 256, now, now + Duration::days(30))
            .unwrap();

        let key = store.data_key(&record).unwrap();
        assert_eq!(key.id(), &record.id);
        assert_eq!(
            record.metadata.get(META_FINGERPRINT),
            Some(&key.material().fingerprint())
        );
        assert_ne!(&record.sealed_material[..], &key.material().as_bytes()[..]);
    }

    #[tokio::test]
    async fn test_new_record_rejects_bad_length() {
        let store = KeyStore::open(repo(), MasterKey::generate()).await.unwrap();
        let now = Utc::now();
        assert!(store
            .new_record(Algorithm::Aes256Gcm, 128, now, now + Duration::days(1))
            .is_err());
    }

    #[tokio::test]
    async fn test_reopen_with_wrong_master_fails() {
        let repo = repo();
        let master = MasterKey::generate();
        KeyStore::open(repo.clone(), master.clone()).await.unwrap();

        assert!(KeyStore::open(repo.clone(), master).await.is_ok());
        let err = KeyStore::open(repo, MasterKey::generate()).await.err().unwrap();
        assert!(matches!(err, Error::NotPermitted(_)));
    }

    #[tokio::test]
    async fn test_passphrase_store_reopens() {
        let repo = repo();
        let store = KeyStore::open_with_passphrase(repo.clone(), b"hunter22", &fast_params())
            .await
            .unwrap();
        let now = Utc::now();
        let record = store
            .new_record(Algorithm::XChaCha20Poly1305, 256, now, now + Duration::days(1))
            .unwrap();
        store.activate(record.clone(), None).await.unwrap();

        let reopened = KeyStore::open_with_passphrase(repo.clone(), b"hunter22", &fast_params())
            .await
            .unwrap();
        let active = reopened.active().await.unwrap().unwrap();
        assert!(reopened.data_key(&active).is_ok());

        assert!(KeyStore::open_with_passphrase(repo, b"wrong", &fast_params())
            .await
            .is_err());
    }
}
