//! Pairwise sessions.
//!
//! A session is bootstrapped with X3DH against the peer's pre-key bundle and
//! then runs the double ratchet: every message advances a hash chain, and
//! every new ratchet key seen from the peer advances the root key with a
//! fresh Diffie-Hellman agreement. Until the peer has answered, every
//! outgoing message carries the pre-key material so the peer can build the
//! matching session.

use crate::signal::SignalError;
use crate::signal::crypto::{
    CHAIN_KEY_SEED, MESSAGE_KEY_SEED, aes_gcm_decrypt, aes_gcm_encrypt, hkdf_sha256, hmac_sha256,
};
use crate::signal::keys::{KeyPair, SignedKeyPair, signal_public_key, verify_signature};
use crate::signal::protocol::{CiphertextMessage, PreKeySignalMessage, SignalMessage};
use crate::signal::record::impl_json_record;
use log::debug;
use serde::{Deserialize, Serialize};

/// Upper bound on cached out-of-order message keys per receiving chain.
pub const MAX_MESSAGE_KEYS: usize = 2000;
/// How far ahead of the chain a counter may be before it is rejected.
pub const MAX_FORWARD_JUMPS: u32 = 25_000;
/// Receiving chains kept per session; older ones are dropped.
pub const MAX_RECEIVER_CHAINS: usize = 5;
const ARCHIVED_STATES_MAX: usize = 40;

const SESSION_KDF_INFO: &[u8] = b"WhisperText";
const RATCHET_KDF_INFO: &[u8] = b"WhisperRatchet";
const MESSAGE_KDF_INFO: &[u8] = b"WhisperMessageKeys";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageKeys {
    #[serde(with = "crate::buffer_json")]
    cipher_key: [u8; 32],
    #[serde(with = "crate::buffer_json")]
    iv: [u8; 12],
    counter: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainKey {
    #[serde(with = "crate::buffer_json")]
    key: [u8; 32],
    index: u32,
}

impl ChainKey {
    fn new(key: [u8; 32], index: u32) -> Self {
        Self { key, index }
    }

    fn message_keys(&self) -> Result<MessageKeys, SignalError> {
        let seed = hmac_sha256(&self.key, &[MESSAGE_KEY_SEED])?;
        let okm: [u8; 44] = hkdf_sha256(&seed, None, MESSAGE_KDF_INFO)?;
        let mut cipher_key = [0u8; 32];
        let mut iv = [0u8; 12];
        cipher_key.copy_from_slice(&okm[..32]);
        iv.copy_from_slice(&okm[32..]);
        Ok(MessageKeys {
            cipher_key,
            iv,
            counter: self.index,
        })
    }

    fn next(&self) -> Result<ChainKey, SignalError> {
        Ok(ChainKey::new(
            hmac_sha256(&self.key, &[CHAIN_KEY_SEED])?,
            self.index + 1,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootKey {
    #[serde(with = "crate::buffer_json")]
    key: [u8; 32],
}

impl RootKey {
    /// One ratchet step: mixes a fresh agreement into the root key and
    /// returns the next root key together with a new chain.
    fn create_chain(
        &self,
        their_ratchet_key: &[u8; 32],
        our_ratchet_key: &KeyPair,
    ) -> Result<(RootKey, ChainKey), SignalError> {
        let shared_secret = our_ratchet_key.calculate_agreement(their_ratchet_key);
        let okm: [u8; 64] = hkdf_sha256(&shared_secret, Some(&self.key), RATCHET_KDF_INFO)?;
        let mut root = [0u8; 32];
        let mut chain = [0u8; 32];
        root.copy_from_slice(&okm[..32]);
        chain.copy_from_slice(&okm[32..]);
        Ok((RootKey { key: root }, ChainKey::new(chain, 0)))
    }
}

/// A chain the peer sends on, keyed by the peer's ratchet key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverChain {
    #[serde(with = "crate::buffer_json")]
    ratchet_key: [u8; 32],
    chain: ChainKey,
    skipped_message_keys: Vec<MessageKeys>,
}

/// Pre-key material repeated on every outgoing message until the peer replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnacknowledgedPreKey {
    pub pre_key_id: Option<u32>,
    pub signed_pre_key_id: u32,
    #[serde(with = "crate::buffer_json")]
    pub base_key: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(with = "crate::buffer_json")]
    local_identity: [u8; 32],
    #[serde(with = "crate::buffer_json")]
    remote_identity: [u8; 32],
    /// The initiator's base key; identifies which pre-key message built us.
    #[serde(with = "crate::buffer_json")]
    base_key: [u8; 32],
    root_key: RootKey,
    sender_ratchet_key: KeyPair,
    sender_chain: ChainKey,
    /// Last counter used on the previous sending chain.
    previous_counter: u32,
    /// Newest first.
    receiver_chains: Vec<ReceiverChain>,
    pending_pre_key: Option<UnacknowledgedPreKey>,
    local_registration_id: u32,
    remote_registration_id: u32,
}

impl SessionState {
    fn sending_aad(&self) -> [u8; 64] {
        concat_identities(&self.local_identity, &self.remote_identity)
    }

    fn receiving_aad(&self) -> [u8; 64] {
        concat_identities(&self.remote_identity, &self.local_identity)
    }

    fn add_receiver_chain(&mut self, ratchet_key: [u8; 32], chain: ChainKey) {
        self.receiver_chains.insert(
            0,
            ReceiverChain {
                ratchet_key,
                chain,
                skipped_message_keys: Vec::new(),
            },
        );
        self.receiver_chains.truncate(MAX_RECEIVER_CHAINS);
    }

    /// Returns the receiving chain for `their_ratchet_key`, stepping the
    /// ratchet first when the key is new. A step also rotates our sending
    /// ratchet key.
    fn receiver_chain_for(
        &mut self,
        their_ratchet_key: &[u8; 32],
    ) -> Result<&mut ReceiverChain, SignalError> {
        let position = self
            .receiver_chains
            .iter()
            .position(|c| &c.ratchet_key == their_ratchet_key);
        let position = match position {
            Some(position) => position,
            None => {
                let (root, receiving) = self
                    .root_key
                    .create_chain(their_ratchet_key, &self.sender_ratchet_key)?;
                let next_ratchet_key = KeyPair::generate();
                let (root, sending) = root.create_chain(their_ratchet_key, &next_ratchet_key)?;

                self.previous_counter = self.sender_chain.index.saturating_sub(1);
                self.root_key = root;
                self.sender_ratchet_key = next_ratchet_key;
                self.sender_chain = sending;
                self.add_receiver_chain(*their_ratchet_key, receiving);
                0
            }
        };
        Ok(&mut self.receiver_chains[position])
    }

    fn receiving_message_keys(
        &mut self,
        their_ratchet_key: &[u8; 32],
        counter: u32,
    ) -> Result<MessageKeys, SignalError> {
        let receiver = self.receiver_chain_for(their_ratchet_key)?;
        let chain_index = receiver.chain.index;
        if counter < chain_index {
            return match receiver
                .skipped_message_keys
                .iter()
                .position(|k| k.counter == counter)
            {
                Some(pos) => Ok(receiver.skipped_message_keys.remove(pos)),
                None => Err(SignalError::DuplicateMessage(counter)),
            };
        }
        if counter - chain_index > MAX_FORWARD_JUMPS {
            return Err(SignalError::TooFarInFuture(counter));
        }

        let mut chain = receiver.chain.clone();
        while chain.index < counter {
            receiver.skipped_message_keys.push(chain.message_keys()?);
            if receiver.skipped_message_keys.len() > MAX_MESSAGE_KEYS {
                receiver.skipped_message_keys.remove(0);
            }
            chain = chain.next()?;
        }
        let keys = chain.message_keys()?;
        receiver.chain = chain.next()?;
        Ok(keys)
    }

    fn decrypt(&mut self, message: &SignalMessage) -> Result<Vec<u8>, SignalError> {
        let keys = self.receiving_message_keys(&message.sender_ratchet_key, message.counter)?;
        let plaintext = aes_gcm_decrypt(
            &keys.cipher_key,
            &keys.iv,
            &message.ciphertext,
            &self.receiving_aad(),
        )?;
        self.pending_pre_key = None;
        Ok(plaintext)
    }
}

fn concat_identities(first: &[u8; 32], second: &[u8; 32]) -> [u8; 64] {
    let mut out = [0u8; 64];
    out[..32].copy_from_slice(first);
    out[32..].copy_from_slice(second);
    out
}

fn derive_keys(secrets: &[u8]) -> Result<(RootKey, ChainKey), SignalError> {
    let okm: [u8; 64] = hkdf_sha256(secrets, Some(&[0u8; 32]), SESSION_KDF_INFO)?;
    let mut root = [0u8; 32];
    let mut chain = [0u8; 32];
    root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    Ok((RootKey { key: root }, ChainKey::new(chain, 0)))
}

/// The current session plus a bounded list of archived ones that can still
/// decrypt late messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    current: Option<SessionState>,
    previous: Vec<SessionState>,
}

impl_json_record!(SessionRecord);

impl SessionRecord {
    pub fn new_fresh() -> Self {
        Self::default()
    }

    pub fn has_current_session(&self) -> bool {
        self.current.is_some()
    }

    pub fn has_session_with_base_key(&self, base_key: &[u8; 32]) -> bool {
        self.current
            .iter()
            .chain(self.previous.iter())
            .any(|s| &s.base_key == base_key)
    }

    fn promote_state(&mut self, state: SessionState) {
        if let Some(old) = self.current.replace(state) {
            self.previous.insert(0, old);
            self.previous.truncate(ARCHIVED_STATES_MAX);
        }
    }
}

/// What a peer publishes so others can start a session with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    pub device_id: u32,
    pub pre_key: Option<(u32, [u8; 32])>,
    pub signed_pre_key_id: u32,
    pub signed_pre_key_public: [u8; 32],
    pub signed_pre_key_signature: [u8; 64],
    pub identity_key: [u8; 32],
}

/// Local identity material needed by session setup.
#[derive(Debug, Clone, Copy)]
pub struct LocalIdentity<'a> {
    pub identity_key: &'a KeyPair,
    pub registration_id: u32,
}

/// Builds an outgoing session from `bundle`, replacing any current one.
pub fn process_pre_key_bundle(
    record: &mut SessionRecord,
    local: LocalIdentity<'_>,
    bundle: &PreKeyBundle,
) -> Result<(), SignalError> {
    if !verify_signature(
        &bundle.identity_key,
        &[&signal_public_key(&bundle.signed_pre_key_public)[..]],
        &bundle.signed_pre_key_signature,
    ) {
        return Err(SignalError::InvalidSignature);
    }

    let base_key = KeyPair::generate();
    let mut secrets = vec![0xFFu8; 32];
    secrets.extend_from_slice(
        &local
            .identity_key
            .calculate_agreement(&bundle.signed_pre_key_public),
    );
    secrets.extend_from_slice(&base_key.calculate_agreement(&bundle.identity_key));
    secrets.extend_from_slice(&base_key.calculate_agreement(&bundle.signed_pre_key_public));
    if let Some((_, one_time)) = &bundle.pre_key {
        secrets.extend_from_slice(&base_key.calculate_agreement(one_time));
    }
    let (root_key, chain_key) = derive_keys(&secrets)?;

    let sender_ratchet_key = KeyPair::generate();
    let (root_key, sender_chain) =
        root_key.create_chain(&bundle.signed_pre_key_public, &sender_ratchet_key)?;

    let mut state = SessionState {
        local_identity: local.identity_key.public_key,
        remote_identity: bundle.identity_key,
        base_key: base_key.public_key,
        root_key,
        sender_ratchet_key,
        sender_chain,
        previous_counter: 0,
        receiver_chains: Vec::new(),
        pending_pre_key: Some(UnacknowledgedPreKey {
            pre_key_id: bundle.pre_key.map(|(id, _)| id),
            signed_pre_key_id: bundle.signed_pre_key_id,
            base_key: base_key.public_key,
        }),
        local_registration_id: local.registration_id,
        remote_registration_id: bundle.registration_id,
    };
    state.add_receiver_chain(bundle.signed_pre_key_public, chain_key);
    record.promote_state(state);
    Ok(())
}

pub fn encrypt(
    record: &mut SessionRecord,
    plaintext: &[u8],
) -> Result<CiphertextMessage, SignalError> {
    let state = record.current.as_mut().ok_or(SignalError::NoSession)?;

    let keys = state.sender_chain.message_keys()?;
    let next_chain = state.sender_chain.next()?;
    let ciphertext = aes_gcm_encrypt(&keys.cipher_key, &keys.iv, plaintext, &state.sending_aad())?;
    state.sender_chain = next_chain;

    let message = SignalMessage {
        sender_ratchet_key: state.sender_ratchet_key.public_key,
        counter: keys.counter,
        previous_counter: state.previous_counter,
        ciphertext,
    };

    Ok(match &state.pending_pre_key {
        Some(pending) => CiphertextMessage::PreKey(PreKeySignalMessage {
            registration_id: state.local_registration_id,
            pre_key_id: pending.pre_key_id,
            signed_pre_key_id: pending.signed_pre_key_id,
            base_key: pending.base_key,
            identity_key: state.local_identity,
            message,
        }),
        None => CiphertextMessage::Whisper(message),
    })
}

/// Decrypts a regular message with whichever stored session it belongs to,
/// trying the current session before the archived ones. The record is only
/// modified when decryption succeeds.
pub fn decrypt_signal_message(
    record: &mut SessionRecord,
    message: &SignalMessage,
) -> Result<Vec<u8>, SignalError> {
    if record.current.is_none() && record.previous.is_empty() {
        return Err(SignalError::NoSession);
    }

    let mut first_error = None;
    if let Some(current) = &record.current {
        let mut candidate = current.clone();
        match candidate.decrypt(message) {
            Ok(plaintext) => {
                record.current = Some(candidate);
                return Ok(plaintext);
            }
            Err(e) => first_error = Some(e),
        }
    }

    for position in 0..record.previous.len() {
        let mut candidate = record.previous[position].clone();
        match candidate.decrypt(message) {
            Ok(plaintext) => {
                record.previous.remove(position);
                debug!(target: "Signal/Session", "Promoting archived session after successful decrypt");
                record.promote_state(candidate);
                return Ok(plaintext);
            }
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    Err(first_error
        .unwrap_or_else(|| SignalError::InvalidMessage("no session could decrypt".into())))
}

/// Decrypts a pre-key message, building the responder session first unless
/// one already exists for its base key.
///
/// Returns the plaintext and the id of the one-time pre-key that was consumed,
/// which the caller should delete.
pub fn decrypt_pre_key_message(
    record: &mut SessionRecord,
    message: &PreKeySignalMessage,
    local: LocalIdentity<'_>,
    signed_pre_key: &SignedKeyPair,
    one_time_pre_key: Option<&KeyPair>,
) -> Result<(Vec<u8>, Option<u32>), SignalError> {
    if record.has_session_with_base_key(&message.base_key) {
        let plaintext = decrypt_signal_message(record, &message.message)?;
        return Ok((plaintext, None));
    }

    if signed_pre_key.key_id != message.signed_pre_key_id {
        return Err(SignalError::InvalidSignedPreKeyId(
            message.signed_pre_key_id,
        ));
    }
    let one_time_pre_key = match (message.pre_key_id, one_time_pre_key) {
        (Some(_), Some(key)) => Some(key),
        (Some(id), None) => return Err(SignalError::InvalidPreKeyId(id)),
        (None, _) => None,
    };

    let spk = &signed_pre_key.key_pair;
    let mut secrets = vec![0xFFu8; 32];
    secrets.extend_from_slice(&spk.calculate_agreement(&message.identity_key));
    secrets.extend_from_slice(&local.identity_key.calculate_agreement(&message.base_key));
    secrets.extend_from_slice(&spk.calculate_agreement(&message.base_key));
    if let Some(opk) = one_time_pre_key {
        secrets.extend_from_slice(&opk.calculate_agreement(&message.base_key));
    }
    let (root_key, chain_key) = derive_keys(&secrets)?;

    let mut state = SessionState {
        local_identity: local.identity_key.public_key,
        remote_identity: message.identity_key,
        base_key: message.base_key,
        root_key,
        sender_ratchet_key: spk.clone(),
        sender_chain: chain_key,
        previous_counter: 0,
        receiver_chains: Vec::new(),
        pending_pre_key: None,
        local_registration_id: local.registration_id,
        remote_registration_id: message.registration_id,
    };
    let plaintext = state.decrypt(&message.message)?;
    record.promote_state(state);
    Ok((plaintext, message.pre_key_id))
}
