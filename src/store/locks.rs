use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard};

const PRUNE_THRESHOLD: usize = 256;

/// One async mutex per key. Entries hold weak handles, so a lock lives only
/// as long as someone holds or waits on it.
pub struct KeyedLocks<K: Eq + Hash + Clone> {
    locks: DashMap<K, Weak<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn handle(&self, key: &K) -> Arc<Mutex<()>> {
        let mut entry = self.locks.entry(key.clone()).or_default();
        if let Some(existing) = entry.upgrade() {
            return existing;
        }
        let fresh = Arc::new(Mutex::new(()));
        *entry = Arc::downgrade(&fresh);
        fresh
    }

    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let handle = self.handle(key);
        if self.locks.len() > PRUNE_THRESHOLD {
            self.prune();
        }
        handle.lock_owned().await
    }

    fn prune(&self) {
        self.locks.retain(|_, weak| weak.strong_count() > 0);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide registry guarding key files, keyed by resolved path.
pub(crate) static FILE_LOCKS: Lazy<KeyedLocks<PathBuf>> = Lazy::new(KeyedLocks::new);

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock(&"a".to_string()).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock(&"a".to_string()).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock(&1u32).await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.lock(&2u32)).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn released_entries_are_pruned() {
        let locks = KeyedLocks::new();
        for i in 0..(PRUNE_THRESHOLD + 10) {
            let _g = locks.lock(&i).await;
        }
        assert!(locks.len() < PRUNE_THRESHOLD);
    }
}
