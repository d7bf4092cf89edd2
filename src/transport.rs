use crate::config::{DEFAULT_ORIGIN, SocketConfig};
use crate::error::EngineError;
use async_trait::async_trait;
use base64::Engine as _;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

/// An event produced by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    /// Raw bytes as read from the socket; frame boundaries are not preserved.
    DataReceived(Bytes),
    Disconnected,
    Error(String),
}

/// Represents an active network connection.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, data: &[u8]) -> Result<(), anyhow::Error>;

    async fn disconnect(&self);
}

/// A factory responsible for creating new transport instances.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create_transport(
        &self,
        url: &Url,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}

/// Validates the configured endpoint and attaches the routing hint.
pub fn resolve_url(config: &SocketConfig, routing_info: Option<&[u8]>) -> Result<Url, EngineError> {
    let mut url = Url::parse(&config.url)
        .map_err(|e| EngineError::Configuration(format!("invalid url {}: {e}", config.url)))?;

    if config.mobile || url.scheme() == "tcp" {
        return Err(EngineError::Configuration(
            "Mobile API is not supported anymore".into(),
        ));
    }
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(EngineError::Configuration(format!(
            "unsupported url scheme {}",
            url.scheme()
        )));
    }

    if url.scheme() == "wss"
        && let Some(routing) = routing_info
    {
        url.query_pairs_mut()
            .append_pair("ED", &BASE64_URL_SAFE_NO_PAD.encode(routing));
    }
    Ok(url)
}

const UNEXPECTED_RESPONSE: &str = "Unexpected server response: ";

/// Turns a dial failure into a typed error, keeping the HTTP status when the
/// server refused the upgrade.
pub fn map_websocket_error(message: &str) -> EngineError {
    let code = message
        .find(UNEXPECTED_RESPONSE)
        .map(|pos| &message[pos + UNEXPECTED_RESPONSE.len()..])
        .and_then(|rest| rest.get(..3))
        .and_then(|digits| digits.parse::<u16>().ok())
        .unwrap_or(500);
    EngineError::WebSocket {
        code,
        message: message.to_string(),
    }
}

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

pub struct WebSocketTransport {
    sink: Mutex<Option<WsSink>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, data: &[u8]) -> Result<(), anyhow::Error> {
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Socket is closed"))?;
        trace!(target: "Transport", "--> {} bytes", data.len());
        sink.send(Message::binary(data.to_vec()))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send error: {e}"))
    }

    async fn disconnect(&self) {
        if let Some(mut sink) = self.sink.lock().await.take()
            && let Err(e) = sink.close().await
        {
            debug!(target: "Transport", "Error closing websocket: {e}");
        }
    }
}

#[derive(Default)]
pub struct WebSocketTransportFactory;

impl WebSocketTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for WebSocketTransportFactory {
    async fn create_transport(
        &self,
        url: &Url,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        info!(target: "Transport", "Dialing {url}");
        let mut request = url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(ORIGIN, HeaderValue::from_static(DEFAULT_ORIGIN));

        let (ws, _response) = connect_async(request).await.map_err(|e| match e {
            tungstenite::Error::Http(response) => {
                anyhow::anyhow!("{UNEXPECTED_RESPONSE}{}", response.status().as_u16())
            }
            other => anyhow::anyhow!("WebSocket connect failed: {other}"),
        })?;
        let (sink, stream) = ws.split();

        let (event_tx, event_rx) = mpsc::channel(100);
        let transport = Arc::new(WebSocketTransport {
            sink: Mutex::new(Some(sink)),
        });

        let _ = event_tx.send(TransportEvent::Connected).await;
        tokio::spawn(read_pump(stream, event_tx));

        Ok((transport, event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                trace!(target: "Transport", "<-- {} bytes", data.len());
                if event_tx.send(TransportEvent::DataReceived(data)).await.is_err() {
                    warn!(target: "Transport", "Event receiver dropped, closing read pump");
                    return;
                }
            }
            Ok(Message::Close(frame)) => {
                debug!(target: "Transport", "Received close frame: {frame:?}");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = event_tx.send(TransportEvent::Error(e.to_string())).await;
                break;
            }
        }
    }
    let _ = event_tx.send(TransportEvent::Disconnected).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_info_is_appended_for_secure_urls() {
        let config = SocketConfig::default();
        let url = resolve_url(&config, Some(&[0xfb, 0xff])).unwrap();
        assert_eq!(url.query(), Some("ED=-_8"));

        let plain = SocketConfig {
            url: "ws://localhost:9000/ws".into(),
            ..Default::default()
        };
        assert_eq!(resolve_url(&plain, Some(&[1])).unwrap().query(), None);
    }

    #[test]
    fn tcp_and_mobile_are_rejected() {
        let tcp = SocketConfig {
            url: "tcp://g.whatsapp.net:443".into(),
            ..Default::default()
        };
        assert!(matches!(
            resolve_url(&tcp, None),
            Err(EngineError::Configuration(_))
        ));

        let mobile = SocketConfig {
            mobile: true,
            ..Default::default()
        };
        assert!(matches!(
            resolve_url(&mobile, None),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn refused_upgrade_keeps_status_code() {
        let err = map_websocket_error("Unexpected server response: 403");
        assert!(matches!(err, EngineError::WebSocket { code: 403, .. }));
        let err = map_websocket_error("connection reset");
        assert!(matches!(err, EngineError::WebSocket { code: 500, .. }));
    }
}
