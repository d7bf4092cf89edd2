//! Pre-key management.
//!
//! One-time pre-keys are generated locally, stored under the `pre-key`
//! category and published to the server so peers can open sessions while
//! this device is offline.

use crate::client::Client;
use crate::error::Result;
use crate::iq::{PreKeyCountSpec, PreKeyUploadSpec};
use crate::store::{KeyCategory, KeyUpdates};
use log::{debug, info, warn};
use std::collections::HashMap;
use waengine_core::signal::KeyPair;

/// Number of pre-keys published in one upload.
pub const INITIAL_PRE_KEY_COUNT: u32 = 30;
/// Server-side count at or below which a new batch is uploaded.
pub const MIN_PRE_KEY_COUNT: u32 = 5;

impl Client {
    pub async fn get_available_pre_keys_on_server(&self) -> Result<u32> {
        self.execute(&PreKeyCountSpec).await
    }

    /// Publishes `count` pre-keys starting at the first one not yet
    /// uploaded, generating whatever is missing locally.
    pub async fn upload_pre_keys(&self, count: u32) -> Result<()> {
        let _guard = self.pre_key_upload.lock().await;
        let creds = self.auth().creds.snapshot().await;

        let first = creds.first_unuploaded_pre_key_id;
        let generated = creds.next_pre_key_id.saturating_sub(first);
        let missing = count.saturating_sub(generated);

        if missing > 0 {
            let start = creds.next_pre_key_id;
            let fresh: HashMap<String, Option<Vec<u8>>> = (start..start + missing)
                .map(|id| (id.to_string(), Some(KeyPair::generate().to_bytes().to_vec())))
                .collect();
            let mut updates = KeyUpdates::new();
            updates.insert(KeyCategory::PreKey, fresh);
            self.keys().set(updates).await?;

            let next = start + missing;
            self.auth()
                .creds
                .modify(|c| c.next_pre_key_id = c.next_pre_key_id.max(next))
                .await;
            self.persist_creds().await;
            debug!(target: "Client/PreKeys", "Generated pre-keys {start}..{next}");
        }

        let ids: Vec<String> = (first..first + count).map(|id| id.to_string()).collect();
        let stored = self.keys().get(KeyCategory::PreKey, &ids).await;
        let mut pre_keys = Vec::with_capacity(ids.len());
        for id in first..first + count {
            match stored.get(&id.to_string()).map(|b| KeyPair::from_bytes(b)) {
                Some(Ok(pair)) => pre_keys.push((id, pair.public_key)),
                Some(Err(e)) => warn!(target: "Client/PreKeys", "Skipping unreadable pre-key {id}: {e}"),
                None => warn!(target: "Client/PreKeys", "Pre-key {id} missing from store"),
            }
        }

        let spec = PreKeyUploadSpec {
            registration_id: creds.registration_id,
            identity_key: creds.signed_identity_key.public_key,
            signed_pre_key_id: creds.signed_pre_key.key_id,
            signed_pre_key_public: creds.signed_pre_key.key_pair.public_key,
            signed_pre_key_signature: creds.signed_pre_key.signature,
            pre_keys,
        };
        let uploaded = spec.pre_keys.len();
        self.execute(&spec).await?;

        let next_unuploaded = first + count;
        self.auth()
            .creds
            .modify(|c| {
                c.first_unuploaded_pre_key_id = c.first_unuploaded_pre_key_id.max(next_unuploaded)
            })
            .await;
        self.persist_creds().await;
        info!(target: "Client/PreKeys", "Uploaded {uploaded} pre-keys");
        Ok(())
    }

    /// Tops up the server's pre-keys when they run low, or unconditionally
    /// when `force` is set.
    pub async fn upload_pre_keys_to_server_if_required(&self, force: bool) -> Result<()> {
        if !force {
            let count = self.get_available_pre_keys_on_server().await?;
            info!(target: "Client/PreKeys", "{count} pre-keys found on server");
            if count > MIN_PRE_KEY_COUNT {
                return Ok(());
            }
        }
        self.upload_pre_keys(INITIAL_PRE_KEY_COUNT).await
    }
}
