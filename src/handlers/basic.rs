use super::traits::StanzaHandler;
use crate::client::Client;
use async_trait::async_trait;
use std::sync::Arc;
use waengine_core::binary::Node;

/// Server stanzas that move the connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStanza {
    /// `<success>`: the login was accepted.
    Success,
    /// `<failure reason=N>`: the login was rejected.
    Failure,
    StreamError,
    StreamEnd,
}

impl LifecycleStanza {
    pub const ALL: [LifecycleStanza; 4] = [
        LifecycleStanza::Success,
        LifecycleStanza::Failure,
        LifecycleStanza::StreamError,
        LifecycleStanza::StreamEnd,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            LifecycleStanza::Success => "success",
            LifecycleStanza::Failure => "failure",
            LifecycleStanza::StreamError => "stream:error",
            LifecycleStanza::StreamEnd => "xmlstreamend",
        }
    }
}

pub struct LifecycleHandler(pub LifecycleStanza);

#[async_trait]
impl StanzaHandler for LifecycleHandler {
    fn tag(&self) -> &'static str {
        self.0.tag()
    }

    async fn handle(&self, client: Arc<Client>, node: Arc<Node>) -> bool {
        match self.0 {
            LifecycleStanza::Success => client.handle_success(&node).await,
            LifecycleStanza::Failure => client.handle_connect_failure(&node),
            LifecycleStanza::StreamError => client.handle_stream_error(&node),
            LifecycleStanza::StreamEnd => client.handle_stream_end(),
        }
        true
    }
}
