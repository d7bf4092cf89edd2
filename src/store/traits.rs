use crate::store::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;

/// Namespaces of stored key entries. The string form is part of the on-disk
/// file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyCategory {
    Session,
    PreKey,
    SenderKey,
    SenderKeyMemory,
    AppStateSyncKey,
    AppStateSyncVersion,
}

impl KeyCategory {
    pub const ALL: [KeyCategory; 6] = [
        KeyCategory::Session,
        KeyCategory::PreKey,
        KeyCategory::SenderKey,
        KeyCategory::SenderKeyMemory,
        KeyCategory::AppStateSyncKey,
        KeyCategory::AppStateSyncVersion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyCategory::Session => "session",
            KeyCategory::PreKey => "pre-key",
            KeyCategory::SenderKey => "sender-key",
            KeyCategory::SenderKeyMemory => "sender-key-memory",
            KeyCategory::AppStateSyncKey => "app-state-sync-key",
            KeyCategory::AppStateSyncVersion => "app-state-sync-version",
        }
    }
}

impl fmt::Display for KeyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `category -> id -> value`; a `None` value deletes the entry.
pub type KeyUpdates = HashMap<KeyCategory, HashMap<String, Option<Vec<u8>>>>;

#[async_trait]
pub trait SignalKeyStore: Send + Sync {
    /// Returns the stored values for `ids`. Missing or unreadable entries are
    /// omitted rather than reported.
    async fn get(&self, category: KeyCategory, ids: &[String]) -> HashMap<String, Vec<u8>>;

    /// Applies every update of the batch. Fails if any single write failed,
    /// after all writes have settled.
    async fn set(&self, updates: KeyUpdates) -> Result<()>;
}
