use crate::error::EngineError;
use crate::socket::SocketState;
use crate::transport::{Transport, TransportEvent, map_websocket_error};
use log::{debug, trace, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::time::timeout;
use waengine_core::binary::{Node, marshal};
use waengine_core::noise::{DecodedFrame, NoiseHandler};

/// Owns the raw transport and the frame cipher. Outbound nodes are encoded
/// and written in cipher-counter order; inbound bytes are decoded into
/// nodes by the single reader.
pub struct FrameSocket {
    state: Arc<watch::Sender<SocketState>>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    noise: Mutex<Box<dyn NoiseHandler>>,
    send_lock: AsyncMutex<()>,
    send_timeout: Duration,
}

impl FrameSocket {
    pub fn new(noise: Box<dyn NoiseHandler>, send_timeout: Duration) -> Self {
        Self {
            state: Arc::new(watch::Sender::new(SocketState::Connecting)),
            transport: Mutex::new(None),
            noise: Mutex::new(noise),
            send_lock: AsyncMutex::new(()),
            send_timeout,
        }
    }

    fn noise(&self) -> MutexGuard<'_, Box<dyn NoiseHandler>> {
        self.noise.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn state(&self) -> SocketState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SocketState> {
        self.state.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SocketState::Ready
    }

    /// Moves to `next` unless the socket is already shutting down.
    fn advance(&self, next: SocketState) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_closed_or_closing() || *state == next {
                return false;
            }
            debug!(target: "Socket", "State {state:?} -> {next:?}");
            *state = next;
            true
        })
    }

    /// Hands the dialed transport to the socket. If the socket was closed
    /// while dialing, the transport is disconnected instead.
    pub fn attach(&self, transport: Arc<dyn Transport>) -> bool {
        let mut slot = self.transport.lock().unwrap_or_else(|e| e.into_inner());
        if self.state().is_closed_or_closing() {
            drop(slot);
            tokio::spawn(async move { transport.disconnect().await });
            return false;
        }
        *slot = Some(transport);
        true
    }

    /// Writes one frame. The send timeout covers waiting for earlier writes
    /// as well as the write itself.
    async fn write_raw(&self, payload: &[u8]) -> Result<(), EngineError> {
        let transport = self.current_transport().ok_or(EngineError::ConnectionClosed)?;
        let write = async {
            let _guard = self.send_lock.lock().await;
            let frame = self.noise().encode_frame(payload)?;
            transport.send(&frame).await.map_err(|e| {
                debug!(target: "Socket", "Transport send failed: {e}");
                EngineError::ConnectionClosed
            })
        };
        match timeout(self.send_timeout, write).await {
            Ok(result) => result,
            Err(_) => {
                warn!(target: "Socket", "Send did not complete within {:?}", self.send_timeout);
                Err(EngineError::ConnectionClosed)
            }
        }
    }

    /// Runs the client side of the handshake, reading the server's reply
    /// from `events`. On success the socket is `Ready`.
    pub async fn handshake(
        &self,
        events: &mut mpsc::Receiver<TransportEvent>,
    ) -> Result<(), EngineError> {
        if !self.advance(SocketState::HandshakeInProgress) {
            return Err(EngineError::ConnectionClosed);
        }

        let hello = self.noise().client_hello()?;
        if let Some(hello) = hello {
            self.write_raw(&hello).await?;
            let server_hello = self.next_handshake_frame(events).await?;
            let finish = self.noise().process_server_hello(&server_hello)?;
            self.write_raw(&finish).await?;
        }
        self.noise().finish_handshake()?;

        if !self.advance(SocketState::Ready) {
            return Err(EngineError::ConnectionClosed);
        }
        Ok(())
    }

    async fn next_handshake_frame(
        &self,
        events: &mut mpsc::Receiver<TransportEvent>,
    ) -> Result<Vec<u8>, EngineError> {
        loop {
            match events.recv().await {
                Some(TransportEvent::DataReceived(data)) => {
                    let frames = self.noise().decode_frame(&data)?;
                    for frame in frames {
                        match frame {
                            DecodedFrame::Handshake(bytes) => return Ok(bytes.to_vec()),
                            DecodedFrame::Node(node) => {
                                warn!(target: "Socket", "Ignoring node received during handshake: {}", node.tag)
                            }
                        }
                    }
                }
                Some(TransportEvent::Connected) => {}
                Some(TransportEvent::Error(message)) => return Err(map_websocket_error(&message)),
                Some(TransportEvent::Disconnected) | None => {
                    return Err(EngineError::ConnectionClosed);
                }
            }
        }
    }

    /// Encodes and writes `node`. Fails with `ConnectionClosed` unless the
    /// socket is ready.
    pub async fn send_node(&self, node: &Node) -> Result<(), EngineError> {
        if !self.is_ready() {
            return Err(EngineError::ConnectionClosed);
        }
        trace!(target: "Socket/Send", "{node}");
        self.write_raw(&marshal(node)).await
    }

    /// Feeds received bytes to the cipher and returns every complete node.
    pub fn decode(&self, data: &[u8]) -> Result<Vec<Node>, EngineError> {
        let frames = self.noise().decode_frame(data)?;
        let mut nodes = Vec::with_capacity(frames.len());
        for frame in frames {
            match frame {
                DecodedFrame::Node(node) => {
                    trace!(target: "Socket/Recv", "{node}");
                    nodes.push(node);
                }
                DecodedFrame::Handshake(bytes) => {
                    warn!(target: "Socket", "Dropping {} byte handshake frame after handshake", bytes.len())
                }
            }
        }
        Ok(nodes)
    }

    /// Starts closing the socket. The transport is disconnected in the
    /// background; the state becomes `Closed` once that finishes.
    pub fn close(&self) {
        let was_active = self.state.send_if_modified(|state| {
            if state.is_closed_or_closing() {
                return false;
            }
            *state = SocketState::Closing;
            true
        });
        if !was_active {
            return;
        }

        let transport = self
            .transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let state = self.state.clone();
        match transport {
            Some(transport) => {
                tokio::spawn(async move {
                    transport.disconnect().await;
                    state.send_replace(SocketState::Closed);
                });
            }
            None => {
                state.send_replace(SocketState::Closed);
            }
        }
    }

    /// Resolves once the socket is ready, or fails if it closes first.
    pub async fn wait_ready(&self) -> Result<(), EngineError> {
        let mut rx = self.subscribe();
        let state = rx
            .wait_for(|s| *s == SocketState::Ready || s.is_closed_or_closing())
            .await
            .map_err(|_| EngineError::ConnectionClosed)?;
        if *state == SocketState::Ready {
            Ok(())
        } else {
            Err(EngineError::ConnectionClosed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockTransportFactory, PlainNoiseHandler};
    use waengine_core::binary::NodeBuilder;
    use waengine_core::noise::framing::encode_frame;

    fn plain_socket() -> FrameSocket {
        FrameSocket::new(Box::new(PlainNoiseHandler::new()), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn sends_are_rejected_until_ready() {
        let socket = plain_socket();
        let (factory, mut server) = MockTransportFactory::new();
        let (transport, mut events) = factory.take();
        assert!(socket.attach(transport));

        let node = NodeBuilder::new("presence").build();
        assert!(matches!(
            socket.send_node(&node).await,
            Err(EngineError::ConnectionClosed)
        ));

        socket.handshake(&mut events).await.unwrap();
        assert_eq!(socket.state(), SocketState::Ready);
        socket.wait_ready().await.unwrap();

        socket.send_node(&node).await.unwrap();
        assert_eq!(server.next_node().await.tag, "presence");
    }

    struct StalledTransport;

    #[async_trait::async_trait]
    impl Transport for StalledTransport {
        async fn send(&self, _data: &[u8]) -> Result<(), anyhow::Error> {
            std::future::pending().await
        }

        async fn disconnect(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn queued_sends_share_one_send_timeout() {
        let socket = FrameSocket::new(Box::new(PlainNoiseHandler::new()), Duration::from_secs(1));
        let (_events_tx, mut events) = mpsc::channel(1);
        assert!(socket.attach(Arc::new(StalledTransport)));
        socket.handshake(&mut events).await.unwrap();

        let node = NodeBuilder::new("presence").build();
        let started = tokio::time::Instant::now();
        let (a, b, c) = tokio::join!(
            socket.send_node(&node),
            socket.send_node(&node),
            socket.send_node(&node)
        );
        for result in [a, b, c] {
            assert!(matches!(result, Err(EngineError::ConnectionClosed)));
        }
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn decode_handles_split_and_batched_frames() {
        let socket = plain_socket();
        let mut wire = Vec::new();
        for id in ["a", "b", "c"] {
            let node = NodeBuilder::new("message").attr("id", id).build();
            wire.extend(encode_frame(&marshal(&node), None).unwrap());
        }

        let (head, tail) = wire.split_at(5);
        assert!(socket.decode(head).unwrap().is_empty());
        let ids: Vec<String> = socket
            .decode(tail)
            .unwrap()
            .iter()
            .map(|n| n.id().unwrap().to_string())
            .collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn close_is_terminal() {
        let socket = plain_socket();
        let (factory, _server) = MockTransportFactory::new();
        let (transport, mut events) = factory.take();
        socket.attach(transport);
        socket.handshake(&mut events).await.unwrap();

        let mut state = socket.subscribe();
        socket.close();
        state
            .wait_for(|s| *s == SocketState::Closed)
            .await
            .unwrap();

        assert!(socket.handshake(&mut events).await.is_err());
        assert!(matches!(
            socket.wait_ready().await,
            Err(EngineError::ConnectionClosed)
        ));

        let (factory, _server) = MockTransportFactory::new();
        assert!(!socket.attach(factory.take().0));
    }
}
