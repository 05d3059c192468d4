//! Active-key cache with TTL and epoch-guarded fills.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use keyledger_crypto::DataKey;

struct Cached {
    key: Arc<DataKey>,
    loaded_at: Instant,
}

/// Cache holding the current active key.
///
/// Readers that miss call [`KeyCache::epoch`] before loading from the store
/// and pass it back to [`KeyCache::insert`]. Any invalidation in between bumps
/// the epoch and the stale fill is dropped.
pub struct KeyCache {
    ttl: Duration,
    slot: RwLock<Option<Cached>>,
    epoch: AtomicU64,
}

impl KeyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: RwLock::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    /// Current invalidation epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Cached key, if present and younger than the TTL.
    pub fn get(&self) -> Option<Arc<DataKey>> {
        let slot = self.slot.read().ok()?;
        slot.as_ref()
            .filter(|cached| cached.loaded_at.elapsed() < self.ttl)
            .map(|cached| cached.key.clone())
    }

    /// Fill the cache if no invalidation happened since `epoch` was read.
    ///
    /// Returns whether the key was stored.
    pub fn insert(&self, key: Arc<DataKey>, epoch: u64) -> bool {
        if self.ttl.is_zero() {
            return false;
        }
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        if self.epoch.load(Ordering::Acquire) != epoch {
            return false;
        }
        *slot = Some(Cached {
            key,
            loaded_at: Instant::now(),
        });
        true
    }

    /// Drop the cached key and reject fills that started earlier.
    pub fn invalidate(&self) {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        *slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyledger_common::KeyId;
    use keyledger_crypto::{Algorithm, KeyMaterial};

    fn data_key(id: &str) -> Arc<DataKey> {
        Arc::new(DataKey::new(
            KeyId::new(id).unwrap(),
            Algorithm::Aes256Gcm,
            KeyMaterial::generate(),
        ))
    }

    #[test]
    fn test_insert_and_get() {
        let cache = KeyCache::new(Duration::from_secs(30));
        assert!(cache.get().is_none());

        assert!(cache.insert(data_key("k1"), cache.epoch()));
        assert_eq!(cache.get().unwrap().id().as_str(), "k1");
    }

    #[test]
    fn test_stale_fill_rejected_after_invalidate() {
        let cache = KeyCache::new(Duration::from_secs(30));
        let epoch = cache.epoch();

        cache.invalidate();
        assert!(!cache.insert(data_key("old"), epoch));
        assert!(cache.get().is_none());
    }

    #[test]
    fn test_invalidate_clears() {
        let cache = KeyCache::new(Duration::from_secs(30));
        cache.insert(data_key("k1"), cache.epoch());
        cache.invalidate();
        assert!(cache.get().is_none());
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = KeyCache::new(Duration::from_millis(10));
        cache.insert(data_key("k1"), cache.epoch());
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get().is_none());
    }

    #[test]
    fn test_zero_ttl_disables_cache() {
        let cache = KeyCache::new(Duration::ZERO);
        assert!(!cache.insert(data_key("k1"), cache.epoch()));
        assert!(cache.get().is_none());
    }
}
