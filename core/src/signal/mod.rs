//! Signal-style end-to-end primitives: identity and pre-keys, pairwise
//! sessions established by X3DH, and sender-key group sessions.
//!
//! Everything here is a pure function over serializable records; loading and
//! storing them is the caller's business.

pub mod address;
mod crypto;
pub mod error;
pub mod group;
pub mod keys;
pub mod protocol;
pub mod record;
pub mod session;

pub use address::{ProtocolAddress, SenderKeyName};
pub use error::SignalError;
pub use keys::{KeyPair, SignedKeyPair};
pub use record::Record;
