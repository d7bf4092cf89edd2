use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("no session available")]
    NoSession,
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("bad mac: message failed to authenticate")]
    BadMac,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("pre-key {0} not found")]
    InvalidPreKeyId(u32),
    #[error("signed pre-key {0} does not match the local signed pre-key")]
    InvalidSignedPreKeyId(u32),
    #[error("duplicate message with counter {0}")]
    DuplicateMessage(u32),
    #[error("message counter {0} is too far in the future")]
    TooFarInFuture(u32),
    #[error("no sender key state for key id {0}")]
    NoSenderKeyState(u32),
    #[error("unsupported message version {0}")]
    UnsupportedVersion(u8),
    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("protobuf decode failed: {0}")]
    Proto(#[from] prost::DecodeError),
}
