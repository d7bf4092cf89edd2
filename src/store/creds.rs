use crate::store::error::Result;
use crate::store::filestore::{backup_path, ensure_folder, read_json, write_json};
use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use log::{info, warn};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use waengine_core::jid::Jid;
use waengine_core::signal::{KeyPair, SignedKeyPair};

const CREDS_FILE: &str = "creds.json";

/// Our own account as confirmed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Me {
    pub id: Jid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid: Option<Jid>,
}

/// Long-lived credentials of this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationCreds {
    pub noise_key: KeyPair,
    pub pairing_ephemeral_key_pair: KeyPair,
    pub signed_identity_key: KeyPair,
    pub signed_pre_key: SignedKeyPair,
    pub registration_id: u32,
    pub adv_secret_key: String,
    #[serde(default)]
    pub me: Option<Me>,
    pub next_pre_key_id: u32,
    pub first_unuploaded_pre_key_id: u32,
    #[serde(default)]
    pub account_sync_counter: u32,
    #[serde(default)]
    pub registered: bool,
    #[serde(
        default,
        with = "waengine_core::buffer_json::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub routing_info: Option<Vec<u8>>,
}

impl AuthenticationCreds {
    /// Fresh credentials for a device that has never logged in.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let identity = KeyPair::generate();
        let mut adv_secret = [0u8; 32];
        rng.fill_bytes(&mut adv_secret);

        Self {
            noise_key: KeyPair::generate(),
            pairing_ephemeral_key_pair: KeyPair::generate(),
            signed_pre_key: identity.create_signed_pre_key(1),
            signed_identity_key: identity,
            registration_id: rng.random_range(1..=16383),
            adv_secret_key: BASE64_STANDARD.encode(adv_secret),
            me: None,
            next_pre_key_id: 1,
            first_unuploaded_pre_key_id: 1,
            account_sync_counter: 0,
            registered: false,
            routing_info: None,
        }
    }
}

/// In-memory copy of [`AuthenticationCreds`] backed by `creds.json`.
pub struct CredentialCache {
    folder: Option<PathBuf>,
    creds: RwLock<AuthenticationCreds>,
}

impl CredentialCache {
    /// Loads `creds.json` from `folder`, creating the folder if needed.
    /// Missing or unreadable credentials are replaced by fresh ones.
    pub async fn load(folder: impl Into<PathBuf>) -> Result<Self> {
        let folder = folder.into();
        ensure_folder(&folder).await?;
        let creds = match read_json(&folder.join(CREDS_FILE)).await {
            Some(creds) => creds,
            None => {
                info!(target: "Store/Creds", "No usable credentials in {}, generating new ones", folder.display());
                AuthenticationCreds::generate()
            }
        };
        Ok(Self {
            folder: Some(folder),
            creds: RwLock::new(creds),
        })
    }

    /// A cache with no backing folder; `save` does nothing.
    pub fn in_memory(creds: AuthenticationCreds) -> Self {
        Self {
            folder: None,
            creds: RwLock::new(creds),
        }
    }

    pub fn folder(&self) -> Option<&Path> {
        self.folder.as_deref()
    }

    pub async fn snapshot(&self) -> AuthenticationCreds {
        self.creds.read().await.clone()
    }

    pub async fn modify<R>(&self, f: impl FnOnce(&mut AuthenticationCreds) -> R) -> R {
        let mut creds = self.creds.write().await;
        f(&mut creds)
    }

    /// Persists the current credentials. A failed write falls back to
    /// [`restore`](Self::restore) instead of returning the error.
    pub async fn save(&self) {
        let Some(folder) = &self.folder else {
            return;
        };
        let creds = self.snapshot().await;
        if let Err(e) = write_json(&folder.join(CREDS_FILE), &creds).await {
            warn!(target: "Store/Creds", "Failed to save credentials: {e}, restoring from backup");
            match self.restore().await {
                Ok(true) => info!(target: "Store/Creds", "Credentials restored from backup"),
                Ok(false) => warn!(target: "Store/Creds", "No credentials backup to restore from"),
                Err(e) => warn!(target: "Store/Creds", "Restoring credentials failed: {e}"),
            }
        }
    }

    /// Replaces the in-memory credentials with `creds.json.bak` and writes
    /// them back as `creds.json`. Returns `false` when there is no usable
    /// backup.
    pub async fn restore(&self) -> Result<bool> {
        let Some(folder) = &self.folder else {
            return Ok(false);
        };
        let path = folder.join(CREDS_FILE);
        let Some(backup) = read_json::<AuthenticationCreds>(&backup_path(&path)).await else {
            return Ok(false);
        };
        *self.creds.write().await = backup.clone();
        write_json(&path, &backup).await?;
        Ok(true)
    }
}
