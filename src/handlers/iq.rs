use super::traits::StanzaHandler;
use crate::client::Client;
use async_trait::async_trait;
use log::warn;
use std::sync::Arc;
use waengine_core::binary::Node;

/// Handler for `<iq>` stanzas that no pending request claimed.
///
/// Replies reach their waiter before routing, so what arrives here are
/// server-initiated queries such as pings.
#[derive(Default)]
pub struct IqHandler;

#[async_trait]
impl StanzaHandler for IqHandler {
    fn tag(&self) -> &'static str {
        "iq"
    }

    async fn handle(&self, client: Arc<Client>, node: Arc<Node>) -> bool {
        if !client.handle_iq(&node).await {
            warn!(target: "Client", "Received unhandled IQ: {node}");
        }
        true
    }
}
