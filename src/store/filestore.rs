use crate::store::error::{Result, StoreError};
use crate::store::locks::FILE_LOCKS;
use crate::store::traits::{KeyCategory, KeyUpdates, SignalKeyStore};
use async_trait::async_trait;
use futures_util::future::join_all;
use log::{debug, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use waengine_core::buffer_json::Buffer;

const BACKUP_SUFFIX: &str = ".bak";

/// Maps an entry to its file name: `{category}-{id}.json` with `/` and `:`
/// replaced so every entry stays a single file in the root folder.
pub fn file_name_for(category: &str, id: &str) -> String {
    format!("{category}-{id}.json")
        .replace('/', "__")
        .replace(':', "-")
}

pub(crate) fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Creates `folder` if needed. An existing non-directory is rejected.
pub(crate) async fn ensure_folder(folder: &Path) -> Result<()> {
    match fs::metadata(folder).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(StoreError::NotADirectory(folder.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(folder).await?;
            Ok(())
        }
        Err(e) => Err(StoreError::Io(e)),
    }
}

/// Writes `value` as JSON to `path`, copying the previous contents to a
/// `.bak` sibling first. Holds the file lock for the whole sequence.
pub(crate) async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec(value)?;
    let _guard = FILE_LOCKS.lock(&path.to_path_buf()).await;

    match fs::copy(path, backup_path(path)).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(target: "Store/File", "Failed to back up {}: {e}", path.display()),
    }

    fs::write(path, data).await.map_err(|e| {
        warn!(target: "Store/File", "Failed to write {}: {e}", path.display());
        StoreError::Io(e)
    })
}

/// Reads and parses `path`. Missing, unreadable or corrupt files are absent.
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let data = {
        let _guard = FILE_LOCKS.lock(&path.to_path_buf()).await;
        match fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                debug!(target: "Store/File", "Failed to read {}: {e}", path.display());
                return None;
            }
        }
    };
    match serde_json::from_slice(&data) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(target: "Store/File", "Ignoring unparsable {}: {e}", path.display());
            None
        }
    }
}

pub(crate) async fn remove_file(path: &Path) -> Result<()> {
    let _guard = FILE_LOCKS.lock(&path.to_path_buf()).await;
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::Io(e)),
    }
}

/// Key store with one JSON file per entry under a single folder.
pub struct MultiFileKeyStore {
    folder: PathBuf,
}

impl MultiFileKeyStore {
    pub async fn open(folder: impl Into<PathBuf>) -> Result<Self> {
        let folder = folder.into();
        ensure_folder(&folder).await?;
        Ok(Self { folder })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    fn path_for(&self, category: KeyCategory, id: &str) -> PathBuf {
        self.folder.join(file_name_for(category.as_str(), id))
    }
}

#[async_trait]
impl SignalKeyStore for MultiFileKeyStore {
    async fn get(&self, category: KeyCategory, ids: &[String]) -> HashMap<String, Vec<u8>> {
        let reads = ids.iter().map(|id| async move {
            let value: Option<Buffer> = read_json(&self.path_for(category, id)).await;
            value.map(|buffer| (id.clone(), buffer.0))
        });
        join_all(reads).await.into_iter().flatten().collect()
    }

    async fn set(&self, updates: KeyUpdates) -> Result<()> {
        let writes: Vec<_> = updates
            .into_iter()
            .flat_map(|(category, entries)| {
                entries
                    .into_iter()
                    .map(move |(id, value)| (self.path_for(category, &id), value))
            })
            .map(|(path, value)| async move {
                match value {
                    Some(bytes) => write_json(&path, &Buffer(bytes)).await,
                    None => remove_file(&path).await,
                }
            })
            .collect();

        let total = writes.len();
        let errors: Vec<StoreError> = join_all(writes)
            .await
            .into_iter()
            .filter_map(|r| r.err())
            .collect();
        match errors.first() {
            None => Ok(()),
            Some(first) => Err(StoreError::WriteFailed {
                failed: errors.len(),
                total,
                first: first.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(
            file_name_for("session", "123.0"),
            "session-123.0.json"
        );
        assert_eq!(
            file_name_for("sender-key", "g/1::a:b"),
            "sender-key-g__1--a-b.json"
        );
    }

    #[tokio::test]
    async fn overwrite_keeps_backup_of_previous_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = MultiFileKeyStore::open(dir.path()).await.unwrap();

        for value in [vec![1u8], vec![2u8]] {
            let mut updates = KeyUpdates::new();
            updates
                .entry(KeyCategory::PreKey)
                .or_default()
                .insert("7".into(), Some(value));
            store.set(updates).await.unwrap();
        }

        let path = dir.path().join("pre-key-7.json");
        let backup: Buffer =
            serde_json::from_slice(&std::fs::read(backup_path(&path)).unwrap()).unwrap();
        assert_eq!(backup.0, vec![1]);
        let current = store.get(KeyCategory::PreKey, &["7".into()]).await;
        assert_eq!(current["7"], vec![2]);
    }

    #[tokio::test]
    async fn open_rejects_a_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(
            MultiFileKeyStore::open(&file).await,
            Err(StoreError::NotADirectory(_))
        ));
    }
}
