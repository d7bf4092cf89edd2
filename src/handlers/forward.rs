use super::traits::StanzaHandler;
use crate::client::Client;
use crate::types::events::EventBus;
use async_trait::async_trait;
use log::trace;
use std::sync::Arc;
use tokio::sync::broadcast;
use waengine_core::binary::Node;

/// Which bus channel an element is republished on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Message,
    Receipt,
    Presence,
    Notification,
    Call,
}

impl Channel {
    fn sender(self, bus: &EventBus) -> &broadcast::Sender<Arc<Node>> {
        match self {
            Channel::Message => &bus.message,
            Channel::Receipt => &bus.receipt,
            Channel::Presence => &bus.presence,
            Channel::Notification => &bus.notification,
            Channel::Call => &bus.call,
        }
    }
}

/// Republishes elements the engine does not interpret itself so that
/// higher layers can subscribe to them.
pub struct ForwardHandler {
    tag: &'static str,
    channel: Channel,
}

impl ForwardHandler {
    pub fn new(tag: &'static str, channel: Channel) -> Self {
        Self { tag, channel }
    }

    pub fn for_message() -> Self {
        Self::new("message", Channel::Message)
    }

    pub fn for_receipt() -> Self {
        Self::new("receipt", Channel::Receipt)
    }

    pub fn for_presence() -> Self {
        Self::new("presence", Channel::Presence)
    }

    pub fn for_chatstate() -> Self {
        Self::new("chatstate", Channel::Presence)
    }

    pub fn for_notification() -> Self {
        Self::new("notification", Channel::Notification)
    }

    pub fn for_call() -> Self {
        Self::new("call", Channel::Call)
    }
}

#[async_trait]
impl StanzaHandler for ForwardHandler {
    fn tag(&self) -> &'static str {
        self.tag
    }

    async fn handle(&self, client: Arc<Client>, node: Arc<Node>) -> bool {
        // no subscribers is fine
        if self.channel.sender(client.events()).send(node).is_err() {
            trace!(target: "Client", "No subscribers for <{}>", self.tag);
        }
        true
    }
}
