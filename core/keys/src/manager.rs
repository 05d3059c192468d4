//! Key lifecycle manager.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::KeyCache;
use crate::config::KeyConfig;
use keyledger_common::{
    AuditEvent, AuditEventKind, Error, EventObserver, KeyId, ObserverSet, Result,
};
use keyledger_crypto::{Algorithm, DataKey};
use keyledger_store::{
    KeyInfo, KeyRecord, KeyStatus, KeyStore, PredecessorUpdate, META_FINGERPRINT,
};

/// How often a revoke re-reads a key that changed under it.
const MAX_REVOKE_ATTEMPTS: usize = 3;

/// Drives every key status change and serves the active key.
pub struct KeyLifecycleManager {
    store: Arc<KeyStore>,
    config: KeyConfig,
    cache: KeyCache,
    observers: ObserverSet,
}

impl KeyLifecycleManager {
    /// Create a manager over an opened key store.
    ///
    /// # Errors
    /// - `Config` if `config` is inconsistent
    pub fn new(store: Arc<KeyStore>, config: KeyConfig) -> Result<Self> {
        config.validate()?;
        let cache = KeyCache::new(config.cache_ttl());
        Ok(Self {
            store,
            config,
            cache,
            observers: ObserverSet::new(),
        })
    }

    /// Register an observer for key events.
    pub fn register_observer(&mut self, observer: Arc<dyn EventObserver>) {
        self.observers.register(observer);
    }

    pub fn config(&self) -> &KeyConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<KeyStore> {
        &self.store
    }

    /// Create a new active key.
    ///
    /// # Postconditions
    /// - The new key is durably active
    /// - A previously active key, if any, is `rotating`, in the same atomic step
    ///
    /// # Errors
    /// - `InvalidInput` if `key_length` does not fit `algorithm`
    /// - `RotationConflict` if the active key changed concurrently
    pub async fn generate_key(&self, algorithm: Algorithm, key_length: u32) -> Result<KeyId> {
        let current = self.store.active().await?;
        let record = self
            .activate_new(algorithm, key_length, current.as_ref(), KeyStatus::Rotating)
            .await?;
        Ok(record.id)
    }

    /// Return the active key id, generating the first key on an empty store.
    pub async fn ensure_active_key(&self) -> Result<KeyId> {
        if let Some(active) = self.store.active().await? {
            return Ok(active.id);
        }

        match self
            .generate_key(self.config.algorithm, self.config.key_length_bits)
            .await
        {
            Ok(id) => Ok(id),
            // Another process bootstrapped first.
            Err(Error::RotationConflict(_)) => self
                .store
                .active()
                .await?
                .map(|record| record.id)
                .ok_or_else(|| Error::NoActiveKey("bootstrap lost its race".to_string())),
            Err(e) => Err(e),
        }
    }

    /// Replace the active key with a fresh one using the configured algorithm.
    ///
    /// # Errors
    /// - `NoActiveKey` if there is nothing to rotate
    /// - `RotationConflict` if another rotation won
    pub async fn rotate(&self) -> Result<KeyId> {
        let current = self.require_active().await?;
        self.rotate_from(&current.id, current.version).await
    }

    /// Rotate only if `key_id` is still the active key at `expected_version`.
    ///
    /// # Errors
    /// - `RotationConflict` if the key moved on since it was read
    pub async fn rotate_from(&self, key_id: &KeyId, expected_version: u64) -> Result<KeyId> {
        let current = self
            .store
            .get(key_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Key not found: {}", key_id)))?;

        if current.status != KeyStatus::Active || current.version != expected_version {
            return Err(Error::RotationConflict(format!(
                "key {} is {} at version {}, expected active at {}",
                key_id, current.status, current.version, expected_version
            )));
        }

        // Stage the version the caller saw, not the one just read.
        let snapshot = KeyRecord {
            version: expected_version,
            ..current
        };
        let record = self
            .activate_new(
                self.config.algorithm,
                self.config.key_length_bits,
                Some(&snapshot),
                KeyStatus::Rotating,
            )
            .await?;
        Ok(record.id)
    }

    /// Whether the active key is within the rotation threshold of expiry.
    ///
    /// # Errors
    /// - `NoActiveKey` if no key is active
    pub async fn needs_rotation(&self) -> Result<bool> {
        let active = self.require_active().await?;
        Ok(active.expires_at - Utc::now() <= self.config.rotation_threshold())
    }

    /// Rotate if [`KeyLifecycleManager::needs_rotation`] says so.
    pub async fn rotate_if_needed(&self) -> Result<Option<KeyId>> {
        if self.needs_rotation().await? {
            self.rotate().await.map(Some)
        } else {
            Ok(None)
        }
    }

    /// Revoke a key.
    ///
    /// Revoking the active key installs a fresh active key and revokes the old
    /// one in the same atomic step. Revoking a revoked key is a no-op.
    ///
    /// # Postconditions
    /// - The key can no longer be fetched for new transactions
    /// - Transactions that already captured its material are unaffected
    ///
    /// # Errors
    /// - `NotFound` if the key does not exist
    /// - `InvalidTransition` if the key is expired
    pub async fn revoke(&self, key_id: &KeyId) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_revoke(key_id).await {
                Err(Error::Conflict(msg)) | Err(Error::RotationConflict(msg))
                    if attempt < MAX_REVOKE_ATTEMPTS =>
                {
                    debug!(key_id = %key_id, attempt, "revoke raced a concurrent change: {}", msg);
                }
                other => return other,
            }
        }
    }

    async fn try_revoke(&self, key_id: &KeyId) -> Result<()> {
        let record = self
            .store
            .get(key_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Key not found: {}", key_id)))?;

        match record.status {
            KeyStatus::Revoked => {
                debug!(key_id = %key_id, "key already revoked");
                Ok(())
            }
            KeyStatus::Expired => Err(Error::InvalidTransition(format!(
                "key {} is expired and cannot be revoked",
                key_id
            ))),
            KeyStatus::Active => {
                let replacement = self
                    .activate_new(
                        self.config.algorithm,
                        self.config.key_length_bits,
                        Some(&record),
                        KeyStatus::Revoked,
                    )
                    .await?;
                warn!(
                    key_id = %key_id,
                    replacement = %replacement.id,
                    "active key revoked, emergency replacement installed"
                );
                Ok(())
            }
            KeyStatus::Rotating => {
                self.store
                    .update_status(key_id, record.version, KeyStatus::Revoked, Utc::now())
                    .await?;
                self.cache.invalidate();
                warn!(key_id = %key_id, "key revoked");
                self.observers.emit(AuditEvent::key(
                    AuditEventKind::KeyRevoked,
                    key_id,
                    KeyStatus::Revoked.as_str(),
                ));
                Ok(())
            }
        }
    }

    /// Expire a rotating key now, ignoring the grace period.
    ///
    /// Expiring an expired key is a no-op.
    ///
    /// # Errors
    /// - `InvalidTransition` unless the key is rotating
    pub async fn expire(&self, key_id: &KeyId) -> Result<()> {
        let record = self
            .store
            .get(key_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Key not found: {}", key_id)))?;

        if record.status == KeyStatus::Expired {
            return Ok(());
        }

        self.store
            .update_status(key_id, record.version, KeyStatus::Expired, Utc::now())
            .await?;
        info!(key_id = %key_id, "key expired");
        self.observers.emit(AuditEvent::key(
            AuditEventKind::KeyExpired,
            key_id,
            KeyStatus::Expired.as_str(),
        ));
        Ok(())
    }

    /// Expire every rotating key whose grace period has elapsed.
    ///
    /// Returns the ids that were expired. Keys changed concurrently (e.g.
    /// revoked meanwhile) are skipped.
    pub async fn expire_due(&self) -> Result<Vec<KeyId>> {
        let now = Utc::now();
        let grace = self.config.rotation_grace();
        let mut expired = Vec::new();

        for record in self.store.list().await? {
            if record.status != KeyStatus::Rotating {
                continue;
            }
            let due = record
                .rotated_at
                .and_then(|at| at.checked_add_signed(grace))
                .map_or(false, |deadline| deadline <= now);
            if !due {
                continue;
            }

            match self
                .store
                .update_status(&record.id, record.version, KeyStatus::Expired, now)
                .await
            {
                Ok(_) => {
                    info!(key_id = %record.id, "rotating key expired after grace period");
                    self.observers.emit(AuditEvent::key(
                        AuditEventKind::KeyExpired,
                        &record.id,
                        KeyStatus::Expired.as_str(),
                    ));
                    expired.push(record.id);
                }
                Err(Error::Conflict(_)) | Err(Error::InvalidTransition(_)) => {
                    debug!(key_id = %record.id, "key changed during expiry sweep, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(expired)
    }

    /// The active key, served from cache when fresh.
    ///
    /// # Errors
    /// - `NoActiveKey` if no key is active; a bootstrapped engine never gets here
    pub async fn get_active_key(&self) -> Result<Arc<DataKey>> {
        if let Some(key) = self.cache.get() {
            return Ok(key);
        }

        let epoch = self.cache.epoch();
        let record = self.require_active().await?;
        let key = Arc::new(self.store.data_key(&record)?);
        self.cache.insert(key.clone(), epoch);
        Ok(key)
    }

    /// Drop the cached active key, e.g. after the store reported it unusable
    /// because another process changed it.
    pub fn invalidate_cached_key(&self) {
        self.cache.invalidate();
    }

    /// Material of an explicitly named key, for payloads tagged with an older id.
    ///
    /// # Errors
    /// - `NotFound` if the key does not exist
    /// - `KeyUnavailable` if the key is expired or revoked
    pub async fn key_for_decrypt(&self, key_id: &KeyId) -> Result<Arc<DataKey>> {
        if let Some(key) = self.cache.get() {
            if key.id() == key_id {
                return Ok(key);
            }
        }

        let record = self
            .store
            .get(key_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Key not found: {}", key_id)))?;

        if !record.status.is_usable() {
            return Err(Error::KeyUnavailable {
                key_id: key_id.to_string(),
                status: record.status.to_string(),
            });
        }

        Ok(Arc::new(self.store.data_key(&record)?))
    }

    pub async fn get_key_status(&self, key_id: &KeyId) -> Result<KeyStatus> {
        Ok(self.key_info(key_id).await?.status)
    }

    pub async fn key_info(&self, key_id: &KeyId) -> Result<KeyInfo> {
        self.store
            .get(key_id)
            .await?
            .map(|record| record.info())
            .ok_or_else(|| Error::NotFound(format!("Key not found: {}", key_id)))
    }

    pub async fn list_keys(&self) -> Result<Vec<KeyInfo>> {
        Ok(self
            .store
            .list()
            .await?
            .iter()
            .map(KeyRecord::info)
            .collect())
    }

    async fn require_active(&self) -> Result<KeyRecord> {
        self.store
            .active()
            .await?
            .ok_or_else(|| Error::NoActiveKey("no key is in the active state".to_string()))
    }

    /// Persist a fresh active key, moving `predecessor` to `predecessor_status`.
    async fn activate_new(
        &self,
        algorithm: Algorithm,
        key_length: u32,
        predecessor: Option<&KeyRecord>,
        predecessor_status: KeyStatus,
    ) -> Result<KeyRecord> {
        let now = Utc::now();
        let expires_at = expiry(now, self.config.key_lifetime())?;
        let record = self.store.new_record(algorithm, key_length, now, expires_at)?;

        let update = predecessor.map(|previous| PredecessorUpdate {
            id: previous.id.clone(),
            expected_version: previous.version,
            status: predecessor_status,
            at: now,
        });

        let result = self.store.activate(record.clone(), update).await;
        // A failed attempt may still mean the active key moved on.
        self.cache.invalidate();
        result.map_err(|e| match e {
            Error::Conflict(msg) => Error::RotationConflict(msg),
            other => other,
        })?;

        info!(
            key_id = %record.id,
            algorithm = %algorithm,
            fingerprint = record.metadata.get(META_FINGERPRINT).map(String::as_str).unwrap_or(""),
            "key activated"
        );
        self.observers.emit(AuditEvent::key(
            AuditEventKind::KeyGenerated,
            &record.id,
            KeyStatus::Active.as_str(),
        ));

        if let Some(previous) = predecessor {
            let kind = match predecessor_status {
                KeyStatus::Revoked => AuditEventKind::KeyRevoked,
                _ => AuditEventKind::KeyRotated,
            };
            info!(key_id = %previous.id, status = %predecessor_status, "predecessor key retired");
            self.observers.emit(
                AuditEvent::key(kind, &previous.id, predecessor_status.as_str())
                    .with_detail(format!("replaced_by {}", record.id)),
            );
        }

        Ok(record)
    }
}

fn expiry(now: DateTime<Utc>, lifetime: Duration) -> Result<DateTime<Utc>> {
    now.checked_add_signed(lifetime)
        .ok_or_else(|| Error::Config("key lifetime overflows the calendar".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyledger_crypto::MasterKey;
    use keyledger_store::{KeyRepository, MemoryRepository};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<AuditEvent>>);

    impl EventObserver for Recording {
        fn notify(&self, event: &AuditEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    impl Recording {
        fn kinds(&self) -> Vec<AuditEventKind> {
            self.0.lock().unwrap().iter().map(|e| e.kind).collect()
        }
    }

    async fn manager_with(config: KeyConfig) -> (KeyLifecycleManager, Arc<Recording>) {
        let repo: Arc<dyn KeyRepository> = Arc::new(MemoryRepository::new());
        let store = Arc::new(KeyStore::open(repo, MasterKey::generate()).await.unwrap());
        let mut manager = KeyLifecycleManager::new(store, config).unwrap();
        let recording = Arc::new(Recording::default());
        manager.register_observer(recording.clone());
        (manager, recording)
    }

    async fn manager() -> (KeyLifecycleManager, Arc<Recording>) {
        manager_with(KeyConfig::default()).await
    }

    async fn active_count(manager: &KeyLifecycleManager) -> usize {
        manager
            .list_keys()
            .await
            .unwrap()
            .iter()
            .filter(|k| k.status == KeyStatus::Active)
            .count()
    }

    #[tokio::test]
    async fn test_generate_then_rotate() {
        let (manager, events) = manager().await;
        let k1 = manager.generate_key(Algorithm::Aes256Gcm, 256).await.unwrap();
        let k2 = manager.rotate().await.unwrap();

        assert_eq!(manager.get_key_status(&k1).await.unwrap(), KeyStatus::Rotating);
        assert_eq!(manager.get_key_status(&k2).await.unwrap(), KeyStatus::Active);
        assert_eq!(manager.get_active_key().await.unwrap().id(), &k2);
        assert_eq!(active_count(&manager).await, 1);
        assert_eq!(
            events.kinds(),
            vec![
                AuditEventKind::KeyGenerated,
                AuditEventKind::KeyGenerated,
                AuditEventKind::KeyRotated
            ]
        );
    }

    #[tokio::test]
    async fn test_rotate_without_active_key() {
        let (manager, _) = manager().await;
        assert!(matches!(manager.rotate().await, Err(Error::NoActiveKey(_))));
        assert!(matches!(manager.get_active_key().await, Err(Error::NoActiveKey(_))));
        assert!(matches!(manager.needs_rotation().await, Err(Error::NoActiveKey(_))));
    }

    #[tokio::test]
    async fn test_concurrent_rotation_from_same_snapshot() {
        let (manager, _) = manager().await;
        let k1 = manager.ensure_active_key().await.unwrap();
        let seen = manager.key_info(&k1).await.unwrap();

        let winner = manager.rotate_from(&k1, seen.version).await;
        let loser = manager.rotate_from(&k1, seen.version).await;

        assert!(winner.is_ok());
        assert!(matches!(loser, Err(Error::RotationConflict(_))));
        assert_eq!(active_count(&manager).await, 1);
        assert_eq!(manager.list_keys().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_revoke_active_installs_replacement() {
        let (manager, events) = manager().await;
        let k1 = manager.ensure_active_key().await.unwrap();
        let cached = manager.get_active_key().await.unwrap();

        manager.revoke(&k1).await.unwrap();

        assert_eq!(manager.get_key_status(&k1).await.unwrap(), KeyStatus::Revoked);
        let active = manager.get_active_key().await.unwrap();
        assert_ne!(active.id(), &k1);
        assert_eq!(active_count(&manager).await, 1);
        // The snapshot taken before revocation still holds its material.
        assert_eq!(cached.id(), &k1);
        assert!(events.kinds().contains(&AuditEventKind::KeyRevoked));
    }

    #[tokio::test]
    async fn test_revoke_rotating_key_blocks_lookup() {
        let (manager, _) = manager().await;
        let k1 = manager.ensure_active_key().await.unwrap();
        manager.rotate().await.unwrap();

        assert!(manager.key_for_decrypt(&k1).await.is_ok());
        manager.revoke(&k1).await.unwrap();

        let err = manager.key_for_decrypt(&k1).await.unwrap_err();
        assert!(matches!(err, Error::KeyUnavailable { .. }));
        // Revoking again is a no-op.
        manager.revoke(&k1).await.unwrap();
    }

    #[tokio::test]
    async fn test_revoke_expired_is_invalid() {
        let (manager, _) = manager().await;
        let k1 = manager.ensure_active_key().await.unwrap();
        manager.rotate().await.unwrap();
        manager.expire(&k1).await.unwrap();

        assert!(matches!(
            manager.revoke(&k1).await,
            Err(Error::InvalidTransition(_))
        ));
        assert!(matches!(
            manager.key_for_decrypt(&k1).await,
            Err(Error::KeyUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_expire_requires_rotating() {
        let (manager, _) = manager().await;
        let k1 = manager.ensure_active_key().await.unwrap();
        assert!(matches!(
            manager.expire(&k1).await,
            Err(Error::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_expire_due_respects_grace() {
        let (manager, _) = manager_with(KeyConfig {
            rotation_grace_secs: 0,
            ..Default::default()
        })
        .await;
        let k1 = manager.ensure_active_key().await.unwrap();
        let k2 = manager.rotate().await.unwrap();

        let expired = manager.expire_due().await.unwrap();
        assert_eq!(expired, vec![k1.clone()]);
        assert_eq!(manager.get_key_status(&k1).await.unwrap(), KeyStatus::Expired);
        assert_eq!(manager.get_key_status(&k2).await.unwrap(), KeyStatus::Active);

        let (patient, _) = self::manager().await;
        patient.ensure_active_key().await.unwrap();
        patient.rotate().await.unwrap();
        assert!(patient.expire_due().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_needs_rotation_threshold() {
        let (fresh, _) = manager().await;
        fresh.ensure_active_key().await.unwrap();
        assert!(!fresh.needs_rotation().await.unwrap());
        assert!(fresh.rotate_if_needed().await.unwrap().is_none());

        let (due, _) = manager_with(KeyConfig {
            key_lifetime_secs: 60,
            rotation_threshold_secs: 59,
            ..Default::default()
        })
        .await;
        // Lifetime minus threshold leaves one second before rotation is due.
        due.ensure_active_key().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert!(due.needs_rotation().await.unwrap());
        assert!(due.rotate_if_needed().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_key_info_has_no_material() {
        let (manager, _) = manager().await;
        let k1 = manager.ensure_active_key().await.unwrap();
        let info = manager.key_info(&k1).await.unwrap();
        let json = serde_json::to_string(&info).unwrap();

        assert!(!json.contains("sealed"));
        assert!(info.metadata.contains_key("fingerprint"));
        assert!(matches!(
            manager.key_info(&KeyId::new("missing").unwrap()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_ensure_active_key_is_stable() {
        let (manager, _) = manager().await;
        let first = manager.ensure_active_key().await.unwrap();
        let second = manager.ensure_active_key().await.unwrap();
        assert_eq!(first, second);
    }
}
