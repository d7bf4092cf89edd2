use crate::client::Client;
use crate::config::SocketConfig;
use crate::store::AuthState;
use crate::transport::{Transport, TransportEvent, TransportFactory};
use crate::types::events::ConnectionState;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;
use waengine_core::binary::{Node, marshal, unmarshal, unpack};
use waengine_core::noise::framing::{FrameDecoder, encode_frame};
use waengine_core::noise::{DecodedFrame, NoiseError, NoiseHandler};

/// Frame handler without encryption or handshake, so tests can speak the
/// wire format directly.
#[derive(Default)]
pub struct PlainNoiseHandler {
    decoder: FrameDecoder,
}

impl PlainNoiseHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NoiseHandler for PlainNoiseHandler {
    fn client_hello(&mut self) -> Result<Option<Vec<u8>>, NoiseError> {
        Ok(None)
    }

    fn process_server_hello(&mut self, _frame: &[u8]) -> Result<Vec<u8>, NoiseError> {
        Err(NoiseError::InvalidPhase("plain handler has no handshake"))
    }

    fn finish_handshake(&mut self) -> Result<(), NoiseError> {
        Ok(())
    }

    fn encode_frame(&mut self, data: &[u8]) -> Result<Vec<u8>, NoiseError> {
        encode_frame(data, None)
    }

    fn decode_frame(&mut self, data: &[u8]) -> Result<Vec<DecodedFrame>, NoiseError> {
        self.decoder.feed(data);
        let mut frames = Vec::new();
        while let Some(frame) = self.decoder.decode_frame() {
            let body = unpack(&frame)?;
            frames.push(DecodedFrame::Node(unmarshal(&body)?));
        }
        Ok(frames)
    }
}

pub struct MockTransport {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    events: mpsc::Sender<TransportEvent>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, data: &[u8]) -> Result<(), anyhow::Error> {
        self.outbound
            .send(data.to_vec())
            .map_err(|_| anyhow::anyhow!("mock server is gone"))
    }

    async fn disconnect(&self) {
        let _ = self.events.send(TransportEvent::Disconnected).await;
    }
}

type PreparedTransport = (Arc<MockTransport>, mpsc::Receiver<TransportEvent>);

/// Hands out a single in-memory transport wired to a [`MockServer`].
pub struct MockTransportFactory {
    prepared: Mutex<Option<PreparedTransport>>,
}

impl MockTransportFactory {
    pub fn new() -> (Self, MockServer) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            outbound: outbound_tx,
            events: event_tx.clone(),
        });
        let factory = Self {
            prepared: Mutex::new(Some((transport, event_rx))),
        };
        let server = MockServer {
            events: event_tx,
            outbound: outbound_rx,
            codec: PlainNoiseHandler::new(),
            received: VecDeque::new(),
        };
        (factory, server)
    }

    /// Transport and event stream for driving a socket directly.
    pub fn take(&self) -> PreparedTransport {
        self.prepared
            .lock()
            .unwrap()
            .take()
            .expect("mock transport already handed out")
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create_transport(
        &self,
        _url: &Url,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        let (transport, events) = self
            .prepared
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("mock transport already handed out"))?;
        Ok((transport, events))
    }
}

/// The far end of a [`MockTransport`].
pub struct MockServer {
    events: mpsc::Sender<TransportEvent>,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    codec: PlainNoiseHandler,
    received: VecDeque<Node>,
}

impl MockServer {
    pub async fn send_raw(&self, data: Vec<u8>) {
        self.events
            .send(TransportEvent::DataReceived(Bytes::from(data)))
            .await
            .expect("client stopped reading");
    }

    pub async fn send_node(&self, node: &Node) {
        let frame = encode_frame(&marshal(node), None).unwrap();
        self.send_raw(frame).await;
    }

    /// Next node written by the client.
    pub async fn next_node(&mut self) -> Node {
        loop {
            if let Some(node) = self.received.pop_front() {
                return node;
            }
            let data = tokio::time::timeout(Duration::from_secs(30), self.outbound.recv())
                .await
                .expect("client sent nothing")
                .expect("client transport dropped");
            for frame in self.codec.decode_frame(&data).unwrap() {
                if let DecodedFrame::Node(node) = frame {
                    self.received.push_back(node);
                }
            }
        }
    }

    pub async fn close(&self) {
        let _ = self.events.send(TransportEvent::Disconnected).await;
    }
}

pub fn test_config() -> SocketConfig {
    SocketConfig {
        url: "ws://127.0.0.1:9/ws".into(),
        connect_timeout: Duration::from_secs(5),
        keep_alive_interval: Duration::from_secs(3600),
        default_query_timeout: Duration::from_secs(10),
        ..SocketConfig::default()
    }
}

/// A client that has not been started.
pub async fn offline_client() -> Arc<Client> {
    let (factory, _server) = MockTransportFactory::new();
    Client::with_noise_handler(
        test_config(),
        AuthState::in_memory(),
        Arc::new(factory),
        Box::new(PlainNoiseHandler::new()),
    )
    .await
    .unwrap()
}

/// A started client whose connection has opened, and the server end.
pub async fn connected_client(config: SocketConfig) -> (Arc<Client>, MockServer) {
    let (factory, server) = MockTransportFactory::new();
    let client = Client::with_noise_handler(
        config,
        AuthState::in_memory(),
        Arc::new(factory),
        Box::new(PlainNoiseHandler::new()),
    )
    .await
    .unwrap();

    let mut updates = client.events().connection_update.subscribe();
    client.start();
    loop {
        let update = updates.recv().await.unwrap();
        if update.connection == Some(ConnectionState::Open) {
            break;
        }
    }
    (client, server)
}
