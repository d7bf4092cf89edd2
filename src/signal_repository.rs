//! End-to-end session state backed by the key store.
//!
//! Every operation loads the records it needs, runs the cipher and writes
//! the results back inside one key-store transaction, holding a lock on the
//! address (or sender-key name) for the whole round.

use crate::error::{EngineError, Result};
use crate::store::{AuthenticationCreds, CredentialCache, KeyCategory, KeyTransaction, KeyedLocks, TransactionalKeyStore};
use log::{debug, warn};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use waengine_core::jid::Jid;
use waengine_core::signal::group::{
    SenderKeyRecord, create_sender_key_distribution_message, group_decrypt, group_encrypt,
    process_sender_key_distribution_message,
};
use waengine_core::signal::protocol::{
    CiphertextMessage, PreKeySignalMessage, SenderKeyDistributionMessage, SignalMessage,
};
use waengine_core::signal::session::{
    LocalIdentity, PreKeyBundle, SessionRecord, decrypt_pre_key_message, decrypt_signal_message,
    encrypt, process_pre_key_bundle,
};
use waengine_core::signal::{KeyPair, ProtocolAddress, Record, SenderKeyName};

/// Wire type of a pairwise ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Carries the pre-key material needed to open the session.
    PreKey,
    Whisper,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::PreKey => "pkmsg",
            MessageKind::Whisper => "msg",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pkmsg" => Ok(MessageKind::PreKey),
            "msg" => Ok(MessageKind::Whisper),
            other => Err(EngineError::MalformedResponse(format!(
                "unknown message type {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMessage {
    pub kind: MessageKind,
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEncryptedMessage {
    pub ciphertext: Vec<u8>,
    pub sender_key_distribution_message: Vec<u8>,
}

/// A sender-key distribution payload as received inside a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderKeyDistributionItem {
    pub group_id: Option<String>,
    pub payload: Vec<u8>,
}

pub fn jid_to_address(jid: &Jid) -> ProtocolAddress {
    ProtocolAddress::new(jid.user.clone(), u32::from(jid.device))
}

pub fn sender_key_name(group: &str, author: &Jid) -> SenderKeyName {
    SenderKeyName::new(group, jid_to_address(author))
}

async fn load_session(txn: &mut KeyTransaction, id: &str) -> Result<SessionRecord> {
    match txn.get_one(KeyCategory::Session, id).await {
        Some(data) => Ok(<SessionRecord as Record>::deserialize(&data)?),
        None => Ok(SessionRecord::new_fresh()),
    }
}

fn store_session(txn: &mut KeyTransaction, id: &str, record: &SessionRecord) -> Result<()> {
    txn.set(KeyCategory::Session, id, Some(Record::serialize(record)?));
    Ok(())
}

async fn load_sender_key(txn: &mut KeyTransaction, name: &str) -> Result<SenderKeyRecord> {
    match txn.get_one(KeyCategory::SenderKey, name).await {
        Some(data) => Ok(<SenderKeyRecord as Record>::deserialize(&data)?),
        None => Ok(SenderKeyRecord::new()),
    }
}

fn store_sender_key(txn: &mut KeyTransaction, name: &str, record: &SenderKeyRecord) -> Result<()> {
    txn.set(KeyCategory::SenderKey, name, Some(Record::serialize(record)?));
    Ok(())
}

fn local_identity(creds: &AuthenticationCreds) -> LocalIdentity<'_> {
    LocalIdentity {
        identity_key: &creds.signed_identity_key,
        registration_id: creds.registration_id,
    }
}

async fn decrypt_in(
    txn: &mut KeyTransaction,
    creds: &AuthenticationCreds,
    address: &str,
    kind: MessageKind,
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let mut record = load_session(txn, address).await?;
    let plaintext = match kind {
        MessageKind::Whisper => {
            let message = SignalMessage::deserialize(ciphertext)?;
            decrypt_signal_message(&mut record, &message)?
        }
        MessageKind::PreKey => {
            let message = PreKeySignalMessage::deserialize(ciphertext)?;
            let one_time = match message.pre_key_id {
                Some(id) => match txn.get_one(KeyCategory::PreKey, &id.to_string()).await {
                    Some(data) => Some(KeyPair::from_bytes(&data)?),
                    None => None,
                },
                None => None,
            };
            let (plaintext, consumed) = decrypt_pre_key_message(
                &mut record,
                &message,
                local_identity(creds),
                &creds.signed_pre_key,
                one_time.as_ref(),
            )?;
            if let Some(id) = consumed {
                debug!(target: "Signal", "Consumed pre-key {id}");
                txn.set(KeyCategory::PreKey, id.to_string(), None);
            }
            plaintext
        }
    };
    store_session(txn, address, &record)?;
    Ok(plaintext)
}

/// Pairwise and group cipher operations over persisted records.
pub struct SignalRepository {
    creds: Arc<CredentialCache>,
    keys: Arc<TransactionalKeyStore>,
    locks: KeyedLocks<String>,
}

impl SignalRepository {
    pub fn new(creds: Arc<CredentialCache>, keys: Arc<TransactionalKeyStore>) -> Self {
        Self {
            creds,
            keys,
            locks: KeyedLocks::new(),
        }
    }

    /// Decrypts a pairwise message, reporting why it failed.
    pub async fn try_decrypt_message(
        &self,
        jid: &Jid,
        kind: MessageKind,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let address = jid_to_address(jid).to_string();
        let _guard = self.locks.lock(&address).await;
        let creds = self.creds.snapshot().await;

        self.keys
            .transaction(|mut txn| async move {
                let result = decrypt_in(&mut txn, &creds, &address, kind, ciphertext).await;
                (txn, result)
            })
            .await
    }

    /// Decrypts a pairwise message. Any failure yields `None`, and no
    /// state is changed.
    pub async fn decrypt_message(
        &self,
        jid: &Jid,
        kind: MessageKind,
        ciphertext: &[u8],
    ) -> Option<Vec<u8>> {
        match self.try_decrypt_message(jid, kind, ciphertext).await {
            Ok(plaintext) => Some(plaintext),
            Err(e) => {
                warn!(target: "Signal", "Failed to decrypt {kind} from {jid}: {e}");
                None
            }
        }
    }

    pub async fn encrypt_message(&self, jid: &Jid, plaintext: &[u8]) -> Result<EncryptedMessage> {
        let address = jid_to_address(jid).to_string();
        let _guard = self.locks.lock(&address).await;

        self.keys
            .transaction(|mut txn| async move {
                let result = async {
                    let mut record = load_session(&mut txn, &address).await?;
                    let message = encrypt(&mut record, plaintext)?;
                    store_session(&mut txn, &address, &record)?;
                    let kind = match message {
                        CiphertextMessage::PreKey(_) => MessageKind::PreKey,
                        CiphertextMessage::Whisper(_) => MessageKind::Whisper,
                    };
                    Ok::<_, EngineError>(EncryptedMessage {
                        kind,
                        ciphertext: message.serialize(),
                    })
                }
                .await;
                (txn, result)
            })
            .await
    }

    pub async fn try_decrypt_group_message(
        &self,
        group: &str,
        author: &Jid,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let name = sender_key_name(group, author).to_string();
        let _guard = self.locks.lock(&name).await;

        self.keys
            .transaction(|mut txn| async move {
                let result = async {
                    let mut record = load_sender_key(&mut txn, &name).await?;
                    let plaintext = group_decrypt(&mut record, ciphertext)?;
                    store_sender_key(&mut txn, &name, &record)?;
                    Ok::<_, EngineError>(plaintext)
                }
                .await;
                (txn, result)
            })
            .await
    }

    /// Decrypts a group message from `author`. Any failure yields `None`.
    pub async fn decrypt_group_message(
        &self,
        group: &str,
        author: &Jid,
        ciphertext: &[u8],
    ) -> Option<Vec<u8>> {
        match self.try_decrypt_group_message(group, author, ciphertext).await {
            Ok(plaintext) => Some(plaintext),
            Err(e) => {
                warn!(target: "Signal", "Failed to decrypt group message in {group} from {author}: {e}");
                None
            }
        }
    }

    /// Encrypts for a group with our own sender key, creating it on first
    /// use. The distribution message lets members decrypt it.
    pub async fn encrypt_group_message(
        &self,
        group: &str,
        me: &Jid,
        plaintext: &[u8],
    ) -> Result<GroupEncryptedMessage> {
        let name = sender_key_name(group, me).to_string();
        let _guard = self.locks.lock(&name).await;

        self.keys
            .transaction(|mut txn| async move {
                let result = async {
                    let mut record = load_sender_key(&mut txn, &name).await?;
                    let distribution = create_sender_key_distribution_message(&mut record)?;
                    let ciphertext = group_encrypt(&mut record, plaintext)?;
                    store_sender_key(&mut txn, &name, &record)?;
                    Ok::<_, EngineError>(GroupEncryptedMessage {
                        ciphertext,
                        sender_key_distribution_message: distribution.serialize(),
                    })
                }
                .await;
                (txn, result)
            })
            .await
    }

    /// Installs the sender key `author` distributed for a group.
    pub async fn process_sender_key_distribution_message(
        &self,
        item: &SenderKeyDistributionItem,
        author: &Jid,
    ) -> Result<()> {
        let group = item.group_id.as_deref().ok_or_else(|| {
            EngineError::Configuration(
                "Group ID is required for sender key distribution message".into(),
            )
        })?;
        let message = SenderKeyDistributionMessage::deserialize(&item.payload)?;
        let name = sender_key_name(group, author).to_string();
        let _guard = self.locks.lock(&name).await;

        self.keys
            .transaction(|mut txn| async move {
                let result = async {
                    let mut record = load_sender_key(&mut txn, &name).await?;
                    process_sender_key_distribution_message(&mut record, &message);
                    store_sender_key(&mut txn, &name, &record)?;
                    Ok::<_, EngineError>(())
                }
                .await;
                (txn, result)
            })
            .await
    }

    /// Opens an outgoing session to `jid` from its published pre-key bundle.
    pub async fn inject_e2e_session(&self, jid: &Jid, bundle: &PreKeyBundle) -> Result<()> {
        let address = jid_to_address(jid).to_string();
        let _guard = self.locks.lock(&address).await;
        let creds = self.creds.snapshot().await;

        self.keys
            .transaction(|mut txn| async move {
                let result = async {
                    let mut record = load_session(&mut txn, &address).await?;
                    process_pre_key_bundle(&mut record, local_identity(&creds), bundle)?;
                    store_session(&mut txn, &address, &record)?;
                    Ok::<_, EngineError>(())
                }
                .await;
                (txn, result)
            })
            .await
    }

    pub async fn has_session(&self, jid: &Jid) -> bool {
        let address = jid_to_address(jid).to_string();
        let stored = self.keys.get(KeyCategory::Session, &[address.clone()]).await;
        stored
            .get(&address)
            .and_then(|data| <SessionRecord as Record>::deserialize(data).ok())
            .is_some_and(|record| record.has_current_session())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransactionOptions;
    use crate::store::{MemoryKeyStore, SignalKeyStore};

    struct Device {
        jid: Jid,
        creds: Arc<CredentialCache>,
        repo: SignalRepository,
    }

    impl Device {
        fn new(jid: &str) -> Self {
            let creds = Arc::new(CredentialCache::in_memory(AuthenticationCreds::generate()));
            let store: Arc<dyn SignalKeyStore> = Arc::new(MemoryKeyStore::new());
            let keys = Arc::new(TransactionalKeyStore::new(store, TransactionOptions::default()));
            Self {
                jid: jid.parse().unwrap(),
                repo: SignalRepository::new(creds.clone(), keys),
                creds,
            }
        }

        /// Publishes one pre-key and returns the bundle a peer would fetch.
        async fn bundle(&self, pre_key_id: u32) -> PreKeyBundle {
            let creds = self.creds.snapshot().await;
            let pre_key = KeyPair::generate();
            let mut updates = crate::store::KeyUpdates::new();
            updates.insert(
                KeyCategory::PreKey,
                [(pre_key_id.to_string(), Some(pre_key.to_bytes().to_vec()))].into(),
            );
            self.repo.keys.set(updates).await.unwrap();

            PreKeyBundle {
                registration_id: creds.registration_id,
                device_id: u32::from(self.jid.device),
                pre_key: Some((pre_key_id, pre_key.public_key)),
                signed_pre_key_id: creds.signed_pre_key.key_id,
                signed_pre_key_public: creds.signed_pre_key.key_pair.public_key,
                signed_pre_key_signature: creds.signed_pre_key.signature,
                identity_key: creds.signed_identity_key.public_key,
            }
        }
    }

    #[test]
    fn addresses_use_user_and_device() {
        let jid: Jid = "5511999:3@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid_to_address(&jid).to_string(), "5511999.3");
        let plain: Jid = "5511999@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid_to_address(&plain).to_string(), "5511999.0");
        assert_eq!(sender_key_name("123@g.us", &jid).to_string(), "123@g.us::5511999::3");
    }

    #[tokio::test]
    async fn pairwise_round_trip_consumes_pre_key() {
        let alice = Device::new("111@s.whatsapp.net");
        let bob = Device::new("222@s.whatsapp.net");

        alice
            .repo
            .inject_e2e_session(&bob.jid, &bob.bundle(7).await)
            .await
            .unwrap();
        assert!(alice.repo.has_session(&bob.jid).await);

        let first = alice.repo.encrypt_message(&bob.jid, b"hello").await.unwrap();
        assert_eq!(first.kind, MessageKind::PreKey);
        let plaintext = bob
            .repo
            .decrypt_message(&alice.jid, first.kind, &first.ciphertext)
            .await;
        assert_eq!(plaintext.as_deref(), Some(&b"hello"[..]));

        let remaining = bob
            .repo
            .keys
            .get(KeyCategory::PreKey, &["7".to_string()])
            .await;
        assert!(remaining.is_empty());

        let reply = bob.repo.encrypt_message(&alice.jid, b"hi").await.unwrap();
        assert_eq!(reply.kind, MessageKind::Whisper);
        let plaintext = alice
            .repo
            .decrypt_message(&bob.jid, reply.kind, &reply.ciphertext)
            .await;
        assert_eq!(plaintext.as_deref(), Some(&b"hi"[..]));

        let next = alice.repo.encrypt_message(&bob.jid, b"again").await.unwrap();
        assert_eq!(next.kind, MessageKind::Whisper);
    }

    #[tokio::test]
    async fn garbage_ciphertext_decrypts_to_none() {
        let alice = Device::new("111@s.whatsapp.net");
        let bob = Device::new("222@s.whatsapp.net");
        assert!(
            bob.repo
                .decrypt_message(&alice.jid, MessageKind::Whisper, b"not a message")
                .await
                .is_none()
        );
        assert!(!bob.repo.has_session(&alice.jid).await);
    }

    #[tokio::test]
    async fn group_round_trip_after_distribution() {
        let group = "120363@g.us";
        let alice = Device::new("111@s.whatsapp.net");
        let bob = Device::new("222@s.whatsapp.net");

        let sent = alice
            .repo
            .encrypt_group_message(group, &alice.jid, b"hi group")
            .await
            .unwrap();
        assert!(
            bob.repo
                .decrypt_group_message(group, &alice.jid, &sent.ciphertext)
                .await
                .is_none()
        );

        let item = SenderKeyDistributionItem {
            group_id: Some(group.to_string()),
            payload: sent.sender_key_distribution_message.clone(),
        };
        bob.repo
            .process_sender_key_distribution_message(&item, &alice.jid)
            .await
            .unwrap();
        let plaintext = bob
            .repo
            .decrypt_group_message(group, &alice.jid, &sent.ciphertext)
            .await;
        assert_eq!(plaintext.as_deref(), Some(&b"hi group"[..]));

        let second = alice
            .repo
            .encrypt_group_message(group, &alice.jid, b"second")
            .await
            .unwrap();
        let plaintext = bob
            .repo
            .decrypt_group_message(group, &alice.jid, &second.ciphertext)
            .await;
        assert_eq!(plaintext.as_deref(), Some(&b"second"[..]));
    }

    #[tokio::test]
    async fn distribution_without_group_is_rejected() {
        let bob = Device::new("222@s.whatsapp.net");
        let item = SenderKeyDistributionItem {
            group_id: None,
            payload: Vec::new(),
        };
        let author: Jid = "111@s.whatsapp.net".parse().unwrap();
        assert!(matches!(
            bob.repo
                .process_sender_key_distribution_message(&item, &author)
                .await,
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn message_kind_parses_wire_names() {
        assert_eq!("pkmsg".parse::<MessageKind>().unwrap(), MessageKind::PreKey);
        assert_eq!("msg".parse::<MessageKind>().unwrap(), MessageKind::Whisper);
        assert!("skmsg".parse::<MessageKind>().is_err());
    }
}
