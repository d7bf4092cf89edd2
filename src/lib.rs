// Wire codec, frame cipher and signal primitives live in the core crate
pub use waengine_core::{binary, jid, noise, signal};

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod iq;
pub mod keepalive;
pub mod prekeys;
pub mod request;
pub mod signal_repository;
pub mod socket;
pub mod store;
pub mod transport;
pub mod types;

#[cfg(test)]
pub mod test_utils;

pub use client::Client;
pub use config::SocketConfig;
pub use error::{DisconnectError, DisconnectReason, EngineError};
pub use store::{AuthState, use_multi_file_auth_state};
pub use transport::{WebSocketTransportFactory, TransportFactory};
pub use types::events::{ConnectionState, ConnectionUpdate, EventBus};
