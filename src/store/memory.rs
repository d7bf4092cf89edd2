use crate::store::error::Result;
use crate::store::traits::{KeyCategory, KeyUpdates, SignalKeyStore};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Volatile key store for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryKeyStore {
    entries: RwLock<HashMap<(KeyCategory, String), Vec<u8>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl SignalKeyStore for MemoryKeyStore {
    async fn get(&self, category: KeyCategory, ids: &[String]) -> HashMap<String, Vec<u8>> {
        let entries = self.entries.read().await;
        ids.iter()
            .filter_map(|id| {
                entries
                    .get(&(category, id.clone()))
                    .map(|v| (id.clone(), v.clone()))
            })
            .collect()
    }

    async fn set(&self, updates: KeyUpdates) -> Result<()> {
        let mut entries = self.entries.write().await;
        for (category, values) in updates {
            for (id, value) in values {
                match value {
                    Some(v) => {
                        entries.insert((category, id), v);
                    }
                    None => {
                        entries.remove(&(category, id));
                    }
                }
            }
        }
        Ok(())
    }
}
