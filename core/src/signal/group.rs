//! Sender-key group sessions: each member ratchets its own chain and shares
//! the chain seed plus a signing key through a distribution message.

use crate::signal::SignalError;
use crate::signal::crypto::{
    CHAIN_KEY_SEED, MESSAGE_KEY_SEED, aes_gcm_decrypt, aes_gcm_encrypt, hkdf_sha256, hmac_sha256,
};
use crate::signal::keys::KeyPair;
use crate::signal::protocol::{SenderKeyDistributionMessage, SenderKeyMessage};
use crate::signal::record::impl_json_record;
use rand::RngCore;
use serde::{Deserialize, Serialize};

const MAX_STATES: usize = 5;
const MAX_MESSAGE_KEYS: usize = 2000;
const MAX_FORWARD_JUMPS: u32 = 25_000;
const GROUP_KDF_INFO: &[u8] = b"WhisperGroup";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SenderMessageKey {
    iteration: u32,
    #[serde(with = "crate::buffer_json")]
    iv: [u8; 12],
    #[serde(with = "crate::buffer_json")]
    cipher_key: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SenderChainKey {
    iteration: u32,
    #[serde(with = "crate::buffer_json")]
    seed: [u8; 32],
}

impl SenderChainKey {
    fn message_key(&self) -> Result<SenderMessageKey, SignalError> {
        let derivative = hmac_sha256(&self.seed, &[MESSAGE_KEY_SEED])?;
        let okm: [u8; 44] = hkdf_sha256(&derivative, None, GROUP_KDF_INFO)?;
        let mut iv = [0u8; 12];
        let mut cipher_key = [0u8; 32];
        iv.copy_from_slice(&okm[..12]);
        cipher_key.copy_from_slice(&okm[12..]);
        Ok(SenderMessageKey {
            iteration: self.iteration,
            iv,
            cipher_key,
        })
    }

    fn next(&self) -> Result<SenderChainKey, SignalError> {
        Ok(SenderChainKey {
            iteration: self.iteration + 1,
            seed: hmac_sha256(&self.seed, &[CHAIN_KEY_SEED])?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SenderKeyState {
    key_id: u32,
    chain_key: SenderChainKey,
    #[serde(with = "crate::buffer_json")]
    signing_public: [u8; 32],
    #[serde(with = "crate::buffer_json::option", default)]
    signing_private: Option<[u8; 32]>,
    message_keys: Vec<SenderMessageKey>,
}

impl SenderKeyState {
    fn message_key_for(&mut self, iteration: u32) -> Result<SenderMessageKey, SignalError> {
        if iteration < self.chain_key.iteration {
            return match self
                .message_keys
                .iter()
                .position(|k| k.iteration == iteration)
            {
                Some(pos) => Ok(self.message_keys.remove(pos)),
                None => Err(SignalError::DuplicateMessage(iteration)),
            };
        }
        if iteration - self.chain_key.iteration > MAX_FORWARD_JUMPS {
            return Err(SignalError::TooFarInFuture(iteration));
        }

        let mut chain = self.chain_key.clone();
        while chain.iteration < iteration {
            self.message_keys.push(chain.message_key()?);
            if self.message_keys.len() > MAX_MESSAGE_KEYS {
                self.message_keys.remove(0);
            }
            chain = chain.next()?;
        }
        let key = chain.message_key()?;
        self.chain_key = chain.next()?;
        Ok(key)
    }
}

/// All known chains of one sender in one group, newest last.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyRecord {
    states: Vec<SenderKeyState>,
}

impl_json_record!(SenderKeyRecord);

impl SenderKeyRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn state_mut(&mut self, key_id: u32) -> Option<&mut SenderKeyState> {
        self.states.iter_mut().find(|s| s.key_id == key_id)
    }

    fn add_state(&mut self, state: SenderKeyState) {
        self.states.retain(|s| s.key_id != state.key_id);
        self.states.push(state);
        if self.states.len() > MAX_STATES {
            self.states.remove(0);
        }
    }
}

/// Returns the distribution message for our own chain, creating the chain
/// on first use.
pub fn create_sender_key_distribution_message(
    record: &mut SenderKeyRecord,
) -> Result<SenderKeyDistributionMessage, SignalError> {
    if record.is_empty() {
        let mut rng = rand::rng();
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        let signing = KeyPair::generate();
        record.add_state(SenderKeyState {
            key_id: rng.next_u32() >> 1,
            chain_key: SenderChainKey { iteration: 0, seed },
            signing_public: signing.public_key,
            signing_private: Some(signing.private_key),
            message_keys: Vec::new(),
        });
    }
    let state = record
        .states
        .last()
        .ok_or_else(|| SignalError::InvalidKey("sender key record is empty".into()))?;
    Ok(SenderKeyDistributionMessage {
        key_id: state.key_id,
        iteration: state.chain_key.iteration,
        chain_key: state.chain_key.seed,
        signing_key: state.signing_public,
    })
}

/// Installs a peer's chain from its distribution message.
pub fn process_sender_key_distribution_message(
    record: &mut SenderKeyRecord,
    message: &SenderKeyDistributionMessage,
) {
    record.add_state(SenderKeyState {
        key_id: message.key_id,
        chain_key: SenderChainKey {
            iteration: message.iteration,
            seed: message.chain_key,
        },
        signing_public: message.signing_key,
        signing_private: None,
        message_keys: Vec::new(),
    });
}

pub fn group_encrypt(
    record: &mut SenderKeyRecord,
    plaintext: &[u8],
) -> Result<Vec<u8>, SignalError> {
    let state = record.states.last_mut().ok_or(SignalError::NoSession)?;
    let signing_private = state
        .signing_private
        .ok_or_else(|| SignalError::InvalidKey("no signing key for own sender chain".into()))?;
    let signing = KeyPair::from_private_key(signing_private);

    let key = state.chain_key.message_key()?;
    let next_chain = state.chain_key.next()?;
    let ciphertext = aes_gcm_encrypt(&key.cipher_key, &key.iv, plaintext, &[])?;
    let message = SenderKeyMessage::new(state.key_id, key.iteration, ciphertext, &signing);
    state.chain_key = next_chain;
    Ok(message.serialized().to_vec())
}

/// Decrypts a group message. The record is only modified on success.
pub fn group_decrypt(record: &mut SenderKeyRecord, data: &[u8]) -> Result<Vec<u8>, SignalError> {
    let message = SenderKeyMessage::deserialize(data)?;
    let stored = record
        .state_mut(message.key_id)
        .ok_or(SignalError::NoSenderKeyState(message.key_id))?;
    if !message.verify_signature(&stored.signing_public) {
        return Err(SignalError::InvalidSignature);
    }

    let mut candidate = stored.clone();
    let key = candidate.message_key_for(message.iteration)?;
    let plaintext = aes_gcm_decrypt(&key.cipher_key, &key.iv, &message.ciphertext, &[])?;
    *stored = candidate;
    Ok(plaintext)
}
