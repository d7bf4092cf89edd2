//! Wire messages. Each is a version byte followed by a protobuf body; sender
//! key messages additionally carry a trailing XEdDSA signature.

use crate::signal::SignalError;
use crate::signal::keys::{
    KeyPair, SIGNATURE_LENGTH, signal_public_key, strip_key_prefix, verify_signature,
};
use prost::Message as _;

pub const CURRENT_VERSION: u8 = 3;

const VERSION_BYTE: u8 = (CURRENT_VERSION << 4) | CURRENT_VERSION;

mod proto {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SignalMessage {
        #[prost(bytes = "vec", optional, tag = "1")]
        pub ratchet_key: Option<Vec<u8>>,
        #[prost(uint32, optional, tag = "2")]
        pub counter: Option<u32>,
        #[prost(uint32, optional, tag = "3")]
        pub previous_counter: Option<u32>,
        #[prost(bytes = "vec", optional, tag = "4")]
        pub ciphertext: Option<Vec<u8>>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PreKeySignalMessage {
        #[prost(uint32, optional, tag = "1")]
        pub pre_key_id: Option<u32>,
        #[prost(bytes = "vec", optional, tag = "2")]
        pub base_key: Option<Vec<u8>>,
        #[prost(bytes = "vec", optional, tag = "3")]
        pub identity_key: Option<Vec<u8>>,
        #[prost(bytes = "vec", optional, tag = "4")]
        pub message: Option<Vec<u8>>,
        #[prost(uint32, optional, tag = "5")]
        pub registration_id: Option<u32>,
        #[prost(uint32, optional, tag = "6")]
        pub signed_pre_key_id: Option<u32>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SenderKeyMessage {
        #[prost(uint32, optional, tag = "1")]
        pub id: Option<u32>,
        #[prost(uint32, optional, tag = "2")]
        pub iteration: Option<u32>,
        #[prost(bytes = "vec", optional, tag = "3")]
        pub ciphertext: Option<Vec<u8>>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SenderKeyDistributionMessage {
        #[prost(uint32, optional, tag = "1")]
        pub id: Option<u32>,
        #[prost(uint32, optional, tag = "2")]
        pub iteration: Option<u32>,
        #[prost(bytes = "vec", optional, tag = "3")]
        pub chain_key: Option<Vec<u8>>,
        #[prost(bytes = "vec", optional, tag = "4")]
        pub signing_key: Option<Vec<u8>>,
    }
}

fn split_version(data: &[u8]) -> Result<&[u8], SignalError> {
    let (&version, body) = data
        .split_first()
        .ok_or_else(|| SignalError::InvalidMessage("empty message".into()))?;
    if version >> 4 != CURRENT_VERSION {
        return Err(SignalError::UnsupportedVersion(version >> 4));
    }
    Ok(body)
}

fn required<T>(field: Option<T>, name: &str) -> Result<T, SignalError> {
    field.ok_or_else(|| SignalError::InvalidMessage(format!("missing field {name}")))
}

fn with_version(body: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(VERSION_BYTE);
    out.extend(body);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalMessage {
    pub sender_ratchet_key: [u8; 32],
    pub counter: u32,
    pub previous_counter: u32,
    pub ciphertext: Vec<u8>,
}

impl SignalMessage {
    pub fn serialize(&self) -> Vec<u8> {
        with_version(
            proto::SignalMessage {
                ratchet_key: Some(signal_public_key(&self.sender_ratchet_key).to_vec()),
                counter: Some(self.counter),
                previous_counter: Some(self.previous_counter),
                ciphertext: Some(self.ciphertext.clone()),
            }
            .encode_to_vec(),
        )
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, SignalError> {
        let msg = proto::SignalMessage::decode(split_version(data)?)?;
        Ok(Self {
            sender_ratchet_key: strip_key_prefix(&required(msg.ratchet_key, "ratchet_key")?)?,
            counter: required(msg.counter, "counter")?,
            previous_counter: msg.previous_counter.unwrap_or(0),
            ciphertext: required(msg.ciphertext, "ciphertext")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeySignalMessage {
    pub registration_id: u32,
    pub pre_key_id: Option<u32>,
    pub signed_pre_key_id: u32,
    pub base_key: [u8; 32],
    pub identity_key: [u8; 32],
    pub message: SignalMessage,
}

impl PreKeySignalMessage {
    pub fn serialize(&self) -> Vec<u8> {
        with_version(
            proto::PreKeySignalMessage {
                pre_key_id: self.pre_key_id,
                base_key: Some(signal_public_key(&self.base_key).to_vec()),
                identity_key: Some(signal_public_key(&self.identity_key).to_vec()),
                message: Some(self.message.serialize()),
                registration_id: Some(self.registration_id),
                signed_pre_key_id: Some(self.signed_pre_key_id),
            }
            .encode_to_vec(),
        )
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, SignalError> {
        let msg = proto::PreKeySignalMessage::decode(split_version(data)?)?;
        Ok(Self {
            registration_id: msg.registration_id.unwrap_or(0),
            pre_key_id: msg.pre_key_id,
            signed_pre_key_id: required(msg.signed_pre_key_id, "signed_pre_key_id")?,
            base_key: strip_key_prefix(&required(msg.base_key, "base_key")?)?,
            identity_key: strip_key_prefix(&required(msg.identity_key, "identity_key")?)?,
            message: SignalMessage::deserialize(&required(msg.message, "message")?)?,
        })
    }
}

/// Output of a pairwise encrypt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CiphertextMessage {
    Whisper(SignalMessage),
    PreKey(PreKeySignalMessage),
}

impl CiphertextMessage {
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            CiphertextMessage::Whisper(m) => m.serialize(),
            CiphertextMessage::PreKey(m) => m.serialize(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderKeyMessage {
    pub key_id: u32,
    pub iteration: u32,
    pub ciphertext: Vec<u8>,
    serialized: Vec<u8>,
}

impl SenderKeyMessage {
    pub fn new(key_id: u32, iteration: u32, ciphertext: Vec<u8>, signing_key: &KeyPair) -> Self {
        let mut serialized = with_version(
            proto::SenderKeyMessage {
                id: Some(key_id),
                iteration: Some(iteration),
                ciphertext: Some(ciphertext.clone()),
            }
            .encode_to_vec(),
        );
        let signature = signing_key.sign(&[serialized.as_slice()]);
        serialized.extend_from_slice(&signature);
        Self {
            key_id,
            iteration,
            ciphertext,
            serialized,
        }
    }

    pub fn serialized(&self) -> &[u8] {
        &self.serialized
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, SignalError> {
        if data.len() < 1 + SIGNATURE_LENGTH {
            return Err(SignalError::InvalidMessage("sender key message too short".into()));
        }
        let body = split_version(&data[..data.len() - SIGNATURE_LENGTH])?;
        let msg = proto::SenderKeyMessage::decode(body)?;
        Ok(Self {
            key_id: required(msg.id, "id")?,
            iteration: required(msg.iteration, "iteration")?,
            ciphertext: required(msg.ciphertext, "ciphertext")?,
            serialized: data.to_vec(),
        })
    }

    pub fn verify_signature(&self, signing_public: &[u8; 32]) -> bool {
        let split = self.serialized.len() - SIGNATURE_LENGTH;
        let mut signature = [0u8; SIGNATURE_LENGTH];
        signature.copy_from_slice(&self.serialized[split..]);
        verify_signature(signing_public, &[&self.serialized[..split]], &signature)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderKeyDistributionMessage {
    pub key_id: u32,
    pub iteration: u32,
    pub chain_key: [u8; 32],
    pub signing_key: [u8; 32],
}

impl SenderKeyDistributionMessage {
    pub fn serialize(&self) -> Vec<u8> {
        with_version(
            proto::SenderKeyDistributionMessage {
                id: Some(self.key_id),
                iteration: Some(self.iteration),
                chain_key: Some(self.chain_key.to_vec()),
                signing_key: Some(signal_public_key(&self.signing_key).to_vec()),
            }
            .encode_to_vec(),
        )
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, SignalError> {
        let msg = proto::SenderKeyDistributionMessage::decode(split_version(data)?)?;
        let chain_key = required(msg.chain_key, "chain_key")?;
        Ok(Self {
            key_id: required(msg.id, "id")?,
            iteration: required(msg.iteration, "iteration")?,
            chain_key: chain_key
                .try_into()
                .map_err(|_| SignalError::InvalidKey("chain key must be 32 bytes".into()))?,
            signing_key: strip_key_prefix(&required(msg.signing_key, "signing_key")?)?,
        })
    }
}
