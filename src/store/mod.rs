pub mod auth_state;
pub mod creds;
pub mod error;
pub mod filestore;
pub mod locks;
pub mod memory;
pub mod traits;
pub mod transaction;

pub use auth_state::{AuthState, use_multi_file_auth_state};
pub use creds::{AuthenticationCreds, CredentialCache, Me};
pub use error::StoreError;
pub use filestore::MultiFileKeyStore;
pub use locks::KeyedLocks;
pub use memory::MemoryKeyStore;
pub use traits::{KeyCategory, KeyUpdates, SignalKeyStore};
pub use transaction::{KeyTransaction, TransactionalKeyStore};
