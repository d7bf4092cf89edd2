use crate::store::creds::{AuthenticationCreds, CredentialCache};
use crate::store::error::Result;
use crate::store::filestore::MultiFileKeyStore;
use crate::store::memory::MemoryKeyStore;
use crate::store::traits::SignalKeyStore;
use std::path::PathBuf;
use std::sync::Arc;

/// Credentials plus the key store they pair with.
#[derive(Clone)]
pub struct AuthState {
    pub creds: Arc<CredentialCache>,
    pub keys: Arc<dyn SignalKeyStore>,
}

impl AuthState {
    pub fn in_memory() -> Self {
        Self {
            creds: Arc::new(CredentialCache::in_memory(AuthenticationCreds::generate())),
            keys: Arc::new(MemoryKeyStore::new()),
        }
    }
}

/// Opens the auth state kept in `folder`: `creds.json` for credentials and
/// one file per key entry next to it.
pub async fn use_multi_file_auth_state(folder: impl Into<PathBuf>) -> Result<AuthState> {
    let folder = folder.into();
    let keys = MultiFileKeyStore::open(&folder).await?;
    let creds = CredentialCache::load(&folder).await?;
    Ok(AuthState {
        creds: Arc::new(creds),
        keys: Arc::new(keys),
    })
}
