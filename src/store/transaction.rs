//! Batches key-store reads and writes of one unit of work.
//!
//! Reads inside a transaction are cached and observe the transaction's own
//! pending writes. The writes are committed in a single `set` once the work
//! succeeds, and dropped if it fails.

use crate::config::TransactionOptions;
use crate::store::error::{Result, StoreError};
use crate::store::traits::{KeyCategory, KeyUpdates, SignalKeyStore};
use log::{trace, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

pub struct KeyTransaction {
    store: Arc<dyn SignalKeyStore>,
    cache: HashMap<KeyCategory, HashMap<String, Option<Vec<u8>>>>,
    mutations: KeyUpdates,
}

impl KeyTransaction {
    fn new(store: Arc<dyn SignalKeyStore>) -> Self {
        Self {
            store,
            cache: HashMap::new(),
            mutations: KeyUpdates::new(),
        }
    }

    pub async fn get(&mut self, category: KeyCategory, ids: &[String]) -> HashMap<String, Vec<u8>> {
        let cached = self.cache.entry(category).or_default();
        let missing: Vec<String> = ids
            .iter()
            .filter(|id| !cached.contains_key(*id))
            .cloned()
            .collect();

        if !missing.is_empty() {
            trace!(target: "Store/Txn", "Fetching {} uncached {category} entries", missing.len());
            let mut fetched = self.store.get(category, &missing).await;
            for id in missing {
                let value = fetched.remove(&id);
                cached.insert(id, value);
            }
        }

        ids.iter()
            .filter_map(|id| {
                cached
                    .get(id)
                    .and_then(|v| v.clone())
                    .map(|v| (id.clone(), v))
            })
            .collect()
    }

    pub async fn get_one(&mut self, category: KeyCategory, id: &str) -> Option<Vec<u8>> {
        let id = id.to_string();
        self.get(category, std::slice::from_ref(&id)).await.remove(&id)
    }

    pub fn set(&mut self, category: KeyCategory, id: impl Into<String>, value: Option<Vec<u8>>) {
        let id = id.into();
        self.cache
            .entry(category)
            .or_default()
            .insert(id.clone(), value.clone());
        self.mutations.entry(category).or_default().insert(id, value);
    }

    pub fn has_mutations(&self) -> bool {
        self.mutations.values().any(|m| !m.is_empty())
    }
}

/// Key store wrapper adding [`KeyTransaction`] support. Plain `get`/`set`
/// pass straight through.
pub struct TransactionalKeyStore {
    inner: Arc<dyn SignalKeyStore>,
    options: TransactionOptions,
}

impl TransactionalKeyStore {
    pub fn new(inner: Arc<dyn SignalKeyStore>, options: TransactionOptions) -> Self {
        Self { inner, options }
    }

    pub fn inner(&self) -> &Arc<dyn SignalKeyStore> {
        &self.inner
    }

    pub async fn get(&self, category: KeyCategory, ids: &[String]) -> HashMap<String, Vec<u8>> {
        self.inner.get(category, ids).await
    }

    pub async fn set(&self, updates: KeyUpdates) -> Result<()> {
        self.inner.set(updates).await
    }

    /// Runs `work` against a fresh transaction and commits its writes when
    /// it returns `Ok`. The transaction is handed back alongside the result
    /// so the work can stay a plain `async move` block.
    pub async fn transaction<T, E, F, Fut>(&self, work: F) -> std::result::Result<T, E>
    where
        F: FnOnce(KeyTransaction) -> Fut,
        Fut: Future<Output = (KeyTransaction, std::result::Result<T, E>)>,
        E: From<StoreError>,
    {
        let (txn, result) = work(KeyTransaction::new(self.inner.clone())).await;
        let value = result?;
        if txn.has_mutations() {
            self.commit(txn.mutations).await?;
        }
        Ok(value)
    }

    async fn commit(&self, mutations: KeyUpdates) -> Result<()> {
        let attempts = self.options.max_commit_retries.max(1);
        let mut tries = 0;
        loop {
            tries += 1;
            match self.inner.set(mutations.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if tries >= attempts => {
                    return Err(StoreError::CommitFailed {
                        attempts: tries,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!(target: "Store/Txn", "Commit attempt {tries} failed: {e}, retrying");
                    tokio::time::sleep(self.options.delay_between_tries).await;
                }
            }
        }
    }
}
