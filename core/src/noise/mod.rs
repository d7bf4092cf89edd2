//! The encrypted framing layer: a Noise XX handshake followed by AES-GCM
//! transport frames, each carried in a 3-byte length-prefixed envelope.

pub mod framing;
pub mod handler;
mod proto;
pub mod state;

use crate::binary::{BinaryError, Node};
use bytes::Bytes;
use thiserror::Error;

pub use handler::XxNoiseHandler;

pub const NOISE_START_PATTERN: &str = "Noise_XX_25519_AESGCM_SHA256\x00\x00\x00\x00";

pub const WA_MAGIC_VALUE: u8 = 6;
pub const DICT_VERSION: u8 = 3;
pub const WA_CONN_HEADER: [u8; 4] = [b'W', b'A', WA_MAGIC_VALUE, DICT_VERSION];

#[derive(Debug, Error)]
pub enum NoiseError {
    #[error("Crypto error: {0}")]
    Crypto(String),
    #[error("Noise handshake failed: {0}")]
    Handshake(String),
    #[error("Frame is too large (max: {max}, got: {got})")]
    FrameTooLarge { max: usize, got: usize },
    #[error("Invalid handshake message: {0}")]
    Proto(#[from] prost::DecodeError),
    #[error("Invalid frame body: {0}")]
    Binary(#[from] BinaryError),
    #[error("Operation not valid in the current handshake phase: {0}")]
    InvalidPhase(&'static str),
}

pub type Result<T> = std::result::Result<T, NoiseError>;

/// One unit produced by feeding inbound bytes into a [`NoiseHandler`].
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    /// A raw handshake payload, produced before the handshake finishes.
    Handshake(Bytes),
    /// A decrypted and decoded protocol element.
    Node(Node),
}

/// The handshake / frame cipher driven by the framed socket.
///
/// `decode_frame` may be fed partial frames or several frames at once; it
/// buffers internally and yields every complete frame in arrival order.
pub trait NoiseHandler: Send {
    /// First handshake message, or `None` for a handler with no handshake.
    fn client_hello(&mut self) -> Result<Option<Vec<u8>>>;

    /// Consumes the server's hello and returns the client finish payload.
    fn process_server_hello(&mut self, frame: &[u8]) -> Result<Vec<u8>>;

    /// Switches to transport mode. After this, frames are encrypted.
    fn finish_handshake(&mut self) -> Result<()>;

    /// Wraps an already marshalled payload into a wire frame.
    fn encode_frame(&mut self, data: &[u8]) -> Result<Vec<u8>>;

    fn decode_frame(&mut self, data: &[u8]) -> Result<Vec<DecodedFrame>>;
}

/// 12-byte nonce with the counter in the trailing four bytes.
pub fn generate_iv(counter: u32) -> [u8; 12] {
    let mut iv = [0u8; 12];
    iv[8..].copy_from_slice(&counter.to_be_bytes());
    iv
}

/// The `ED` pre-intro carrying edge routing info, sent ahead of the
/// connection header.
pub fn build_edge_routing_preintro(routing_info: &[u8]) -> Vec<u8> {
    let len = routing_info.len() as u32;
    let mut intro = Vec::with_capacity(7 + routing_info.len());
    intro.extend_from_slice(b"ED");
    intro.extend_from_slice(&[0, 1]);
    intro.extend_from_slice(&len.to_be_bytes()[1..]);
    intro.extend_from_slice(routing_info);
    intro
}
