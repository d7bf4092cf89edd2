//! Request builders paired with their response parsers.
//!
//! ## Ping
//! ```xml
//! <iq xmlns="w:p" type="get" to="s.whatsapp.net" id="..."><ping/></iq>
//! ```
//!
//! ## Pre-key count
//! ```xml
//! <iq xmlns="encrypt" type="get" to="s.whatsapp.net" id="..."><count/></iq>
//! <iq type="result" id="..."><count value="42"/></iq>
//! ```
//!
//! ## Pre-key upload
//! ```xml
//! <iq xmlns="encrypt" type="set" to="s.whatsapp.net" id="...">
//!   <registration>[4-byte BE registration id]</registration>
//!   <type>[0x05]</type>
//!   <identity>[32-byte identity public key]</identity>
//!   <list>
//!     <key><id>[3-byte BE id]</id><value>[32-byte public key]</value></key>
//!   </list>
//!   <skey><id/><value/><signature/></skey>
//! </iq>
//! ```

use crate::error::EngineError;
use crate::request::InfoQuery;
use std::time::Duration;
use waengine_core::binary::{Node, NodeBuilder, NodeContent};
use waengine_core::jid::Jid;
use waengine_core::signal::keys::DJB_TYPE;

pub trait IqSpec {
    type Response;

    fn build_iq(&self) -> InfoQuery<'static>;

    fn parse_response(&self, response: &Node) -> Result<Self::Response, EngineError>;
}

/// Keepalive ping. `timeout` overrides the default query timeout.
#[derive(Debug, Clone, Default)]
pub struct PingSpec {
    pub timeout: Option<Duration>,
}

impl IqSpec for PingSpec {
    type Response = ();

    fn build_iq(&self) -> InfoQuery<'static> {
        let iq = InfoQuery::get(
            "w:p",
            Jid::server_jid(),
            Some(NodeContent::Nodes(vec![NodeBuilder::new("ping").build()])),
        );
        match self.timeout {
            Some(timeout) => iq.with_timeout(timeout),
            None => iq,
        }
    }

    fn parse_response(&self, _response: &Node) -> Result<(), EngineError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PreKeyCountSpec;

impl IqSpec for PreKeyCountSpec {
    type Response = u32;

    fn build_iq(&self) -> InfoQuery<'static> {
        InfoQuery::get(
            "encrypt",
            Jid::server_jid(),
            Some(NodeContent::Nodes(vec![NodeBuilder::new("count").build()])),
        )
    }

    fn parse_response(&self, response: &Node) -> Result<u32, EngineError> {
        let count = response
            .get_optional_child("count")
            .ok_or_else(|| EngineError::MalformedResponse("missing <count> node".into()))?;
        // a bare <count/> means none are left
        Ok(count
            .attr("value")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }
}

fn encode_key_id(id: u32) -> Vec<u8> {
    id.to_be_bytes()[1..].to_vec()
}

#[derive(Debug, Clone)]
pub struct PreKeyUploadSpec {
    pub registration_id: u32,
    pub identity_key: [u8; 32],
    pub signed_pre_key_id: u32,
    pub signed_pre_key_public: [u8; 32],
    pub signed_pre_key_signature: [u8; 64],
    pub pre_keys: Vec<(u32, [u8; 32])>,
}

impl IqSpec for PreKeyUploadSpec {
    type Response = ();

    fn build_iq(&self) -> InfoQuery<'static> {
        let keys = self.pre_keys.iter().map(|(id, public)| {
            NodeBuilder::new("key")
                .child(NodeBuilder::new("id").bytes(encode_key_id(*id)).build())
                .child(NodeBuilder::new("value").bytes(public.to_vec()).build())
                .build()
        });
        let content = vec![
            NodeBuilder::new("registration")
                .bytes(self.registration_id.to_be_bytes().to_vec())
                .build(),
            NodeBuilder::new("type").bytes(vec![DJB_TYPE]).build(),
            NodeBuilder::new("identity")
                .bytes(self.identity_key.to_vec())
                .build(),
            NodeBuilder::new("list").children(keys).build(),
            NodeBuilder::new("skey")
                .children([
                    NodeBuilder::new("id")
                        .bytes(encode_key_id(self.signed_pre_key_id))
                        .build(),
                    NodeBuilder::new("value")
                        .bytes(self.signed_pre_key_public.to_vec())
                        .build(),
                    NodeBuilder::new("signature")
                        .bytes(self.signed_pre_key_signature.to_vec())
                        .build(),
                ])
                .build(),
        ];
        InfoQuery::set("encrypt", Jid::server_jid(), Some(NodeContent::Nodes(content)))
    }

    fn parse_response(&self, _response: &Node) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Unlinks this companion device from the account.
#[derive(Debug, Clone)]
pub struct RemoveCompanionDeviceSpec {
    pub jid: Jid,
    pub reason: &'static str,
}

impl IqSpec for RemoveCompanionDeviceSpec {
    type Response = ();

    fn build_iq(&self) -> InfoQuery<'static> {
        let remove = NodeBuilder::new("remove-companion-device")
            .attr("jid", self.jid.to_string())
            .attr("reason", self.reason)
            .build();
        InfoQuery::set("md", Jid::server_jid(), Some(NodeContent::Nodes(vec![remove])))
    }

    fn parse_response(&self, _response: &Node) -> Result<(), EngineError> {
        Ok(())
    }
}
