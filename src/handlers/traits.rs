use crate::client::Client;
use async_trait::async_trait;
use std::sync::Arc;
use waengine_core::binary::Node;

/// Handles one top-level element tag received from the server.
///
/// Handlers run on the reader task, one element at a time, so anything they
/// await delays the elements behind it.
#[async_trait]
pub trait StanzaHandler: Send + Sync {
    /// The tag this handler is registered under (e.g. "iq", "success").
    fn tag(&self) -> &'static str;

    /// Returns `false` if the element was not understood and should be
    /// logged as unhandled.
    async fn handle(&self, client: Arc<Client>, node: Arc<Node>) -> bool;
}
