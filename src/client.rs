use crate::backoff::Backoff;
use crate::config::SocketConfig;
use crate::error::{DisconnectReason, EngineError, Result};
use crate::handlers::basic::{LifecycleHandler, LifecycleStanza};
use crate::handlers::forward::ForwardHandler;
use crate::handlers::iq::IqHandler;
use crate::handlers::router::StanzaRouter;
use crate::iq::{IqSpec, RemoveCompanionDeviceSpec};
use crate::request::{RequestCorrelator, check_reply};
use crate::signal_repository::SignalRepository;
use crate::socket::{FrameSocket, SocketState};
use crate::store::{AuthState, TransactionalKeyStore};
use crate::transport::{TransportEvent, TransportFactory, map_websocket_error, resolve_url};
use crate::types::events::{ConnectionState, ConnectionUpdate, EventBus, LastDisconnect};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;
use waengine_core::binary::{Node, NodeBuilder};
use waengine_core::jid::{Jid, SERVER_JID};
use waengine_core::noise::{NoiseHandler, XxNoiseHandler};

/// One connection to the server: owns the framed socket, the request
/// correlator and the lifecycle of the reader and heartbeat tasks.
///
/// A `Client` is single-use. Once [`end`](Client::end) has run it stays
/// closed; reconnecting means building a new one from the same
/// [`AuthState`].
pub struct Client {
    config: SocketConfig,
    auth: AuthState,
    keys: Arc<TransactionalKeyStore>,
    factory: Arc<dyn TransportFactory>,
    url: Url,

    pub(crate) socket: Arc<FrameSocket>,
    pub(crate) correlator: RequestCorrelator,
    pub(crate) backoff: Backoff,
    events: EventBus,
    router: StanzaRouter,
    signal: SignalRepository,

    started: AtomicBool,
    closed: AtomicBool,
    logged_in: AtomicBool,
    last_received: Mutex<Instant>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) pre_key_upload: AsyncMutex<()>,
}

impl Client {
    /// Builds a client for `auth` without dialing. The endpoint is checked
    /// here, so an unsupported URL fails before any I/O.
    pub async fn new(
        config: SocketConfig,
        auth: AuthState,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Arc<Self>> {
        let creds = auth.creds.snapshot().await;
        let noise = XxNoiseHandler::new(
            creds.noise_key.clone(),
            config.client_payload.clone(),
            creds.routing_info.as_deref(),
        );
        Self::with_noise_handler(config, auth, factory, Box::new(noise)).await
    }

    /// Like [`new`](Self::new) but with a caller-supplied frame cipher.
    pub async fn with_noise_handler(
        config: SocketConfig,
        auth: AuthState,
        factory: Arc<dyn TransportFactory>,
        noise: Box<dyn NoiseHandler>,
    ) -> Result<Arc<Self>> {
        let routing_info = auth.creds.snapshot().await.routing_info;
        let url = resolve_url(&config, routing_info.as_deref())?;

        let keys = Arc::new(TransactionalKeyStore::new(
            auth.keys.clone(),
            config.transaction.clone(),
        ));
        let signal = SignalRepository::new(auth.creds.clone(), keys.clone());

        Ok(Arc::new(Self {
            socket: Arc::new(FrameSocket::new(noise, config.connect_timeout)),
            correlator: RequestCorrelator::new(),
            backoff: Backoff::new(config.backoff_delay, config.max_backoff_delay),
            events: EventBus::new(),
            router: Self::create_stanza_router(),
            signal,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            logged_in: AtomicBool::new(false),
            last_received: Mutex::new(Instant::now()),
            tasks: Mutex::new(Vec::new()),
            pre_key_upload: AsyncMutex::new(()),
            config,
            auth,
            keys,
            factory,
            url,
        }))
    }

    /// Builds a client and starts connecting in the background. Progress is
    /// reported on `events().connection_update`.
    pub async fn connect(
        config: SocketConfig,
        auth: AuthState,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Arc<Self>> {
        let client = Self::new(config, auth, factory).await?;
        client.start();
        Ok(client)
    }

    fn create_stanza_router() -> StanzaRouter {
        let mut router = StanzaRouter::new();

        router.register(Arc::new(IqHandler));
        for stanza in LifecycleStanza::ALL {
            router.register(Arc::new(LifecycleHandler(stanza)));
        }

        router.register(Arc::new(ForwardHandler::for_message()));
        router.register(Arc::new(ForwardHandler::for_receipt()));
        router.register(Arc::new(ForwardHandler::for_presence()));
        router.register(Arc::new(ForwardHandler::for_chatstate()));
        router.register(Arc::new(ForwardHandler::for_notification()));
        router.register(Arc::new(ForwardHandler::for_call()));

        router
    }

    /// Spawns the connection task. Calling it more than once has no effect.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!(target: "Client", "Client `start` called while already running.");
            return;
        }
        let client = self.clone();
        self.track(tokio::spawn(async move { client.run().await }));
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    pub fn auth(&self) -> &AuthState {
        &self.auth
    }

    pub fn keys(&self) -> &Arc<TransactionalKeyStore> {
        &self.keys
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn signal_repository(&self) -> &SignalRepository {
        &self.signal
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn socket_state(&self) -> SocketState {
        self.socket.state()
    }

    pub fn is_ready(&self) -> bool {
        self.socket.is_ready()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::Relaxed)
    }

    pub fn generate_message_tag(&self) -> String {
        self.correlator.generate_tag()
    }

    pub(crate) fn last_received(&self) -> Instant {
        *self.last_received.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn touch(&self) {
        *self.last_received.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// Keeps `handle` so that `end` can abort it. A task registered after
    /// `end` already ran is aborted straight away.
    pub(crate) fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_closed() {
            handle.abort();
        } else {
            tasks.retain(|t| !t.is_finished());
            tasks.push(handle);
        }
    }

    async fn run(self: Arc<Self>) {
        self.events
            .connection_update
            .emit(ConnectionUpdate::state(ConnectionState::Connecting));
        info!(target: "Client", "Connecting to {}", self.url);

        let (transport, mut transport_events) =
            match self.factory.create_transport(&self.url).await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(target: "Client", "Failed to open transport: {e}");
                    self.end(Some(map_websocket_error(&e.to_string())));
                    return;
                }
            };
        if !self.socket.attach(transport) {
            debug!(target: "Client", "Client closed while dialing");
            return;
        }

        let handshake = tokio::time::timeout(
            self.config.connect_timeout,
            self.socket.handshake(&mut transport_events),
        )
        .await;
        match handshake {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(target: "Client", "Handshake failed: {e}");
                self.end(Some(e));
                return;
            }
            Err(_) => {
                error!(target: "Client", "Handshake did not finish within {:?}", self.config.connect_timeout);
                self.end(Some(EngineError::Timeout));
                return;
            }
        }

        self.touch();
        info!(target: "Client", "Handshake complete, connection open");
        self.events
            .connection_update
            .emit(ConnectionUpdate::state(ConnectionState::Open));

        let client = self.clone();
        self.track(tokio::spawn(async move { client.keepalive_loop().await }));

        self.read_messages_loop(transport_events).await;
    }

    /// Processes transport events strictly in arrival order until the
    /// connection ends.
    async fn read_messages_loop(self: &Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        info!(target: "Client", "Starting message processing loop...");
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::DataReceived(data) => {
                    self.touch();
                    let nodes = match self.socket.decode(&data) {
                        Ok(nodes) => nodes,
                        Err(e) => {
                            error!(target: "Client", "Failed to decode frame: {e}");
                            self.end(Some(e));
                            return;
                        }
                    };
                    for node in nodes {
                        self.process_node(Arc::new(node)).await;
                        if self.is_closed() {
                            return;
                        }
                    }
                }
                TransportEvent::Connected => {
                    debug!(target: "Client", "Transport connected event received");
                }
                TransportEvent::Error(message) => {
                    error!(target: "Client", "Transport error: {message}");
                    self.end(Some(map_websocket_error(&message)));
                    return;
                }
                TransportEvent::Disconnected => break,
            }
        }
        self.end(Some(EngineError::Stream {
            reason: DisconnectReason::ConnectionClosed,
            message: "Connection Terminated".into(),
        }));
    }

    pub(crate) async fn process_node(self: &Arc<Self>, node: Arc<Node>) {
        let _ = self.events.frame.send(node.clone());

        if self.correlator.resolve(&node) {
            return;
        }

        if !self.router.dispatch(self.clone(), node.clone()).await {
            debug!(target: "Client", "Received unknown top-level node: {node}");
        }
    }

    /// Closes the connection. Only the first call has any effect: it stops
    /// the background tasks, fails every pending request, closes the socket
    /// and publishes the terminal `Close` update.
    pub fn end(&self, error: Option<EngineError>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match &error {
            Some(e) => info!(target: "Client", "Connection closed: {e}"),
            None => info!(target: "Client", "Connection closed"),
        }

        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
        self.correlator.close();
        self.socket.close();
        self.logged_in.store(false, Ordering::Relaxed);

        self.events.connection_update.emit(ConnectionUpdate {
            connection: Some(ConnectionState::Close),
            last_disconnect: Some(LastDisconnect {
                error: error.as_ref().map(EngineError::to_disconnect_error),
                date: Utc::now(),
            }),
            ..Default::default()
        });
        self.events.connection_update.close();
    }

    /// Writes `node` once any rate-limit backoff has expired.
    pub async fn send_node(&self, node: &Node) -> Result<()> {
        if let Some(delay) = self.backoff.remaining() {
            debug!(target: "Client", "Holding <{}> for {delay:?} of backoff", node.tag);
        }
        self.backoff.wait().await;
        self.socket.send_node(node).await
    }

    /// Sends `node` and waits for the element carrying the same id. A tag is
    /// generated when the node has no id.
    pub async fn query(&self, mut node: Node, timeout: Option<Duration>) -> Result<Node> {
        if !self.is_ready() {
            return Err(EngineError::ConnectionClosed);
        }
        let id = match node.id() {
            Some(id) => id.to_string(),
            None => {
                let tag = self.generate_message_tag();
                node.attrs.insert("id".into(), tag.clone());
                tag
            }
        };

        // one deadline covers backoff, the write and the reply
        let deadline = Instant::now() + timeout.unwrap_or(self.config.default_query_timeout);
        let pending = self.correlator.register(id)?;
        let exchange = async {
            self.send_node(&node).await?;
            pending.wait_until(deadline).await
        };
        let reply = match tokio::time::timeout_at(deadline, exchange).await {
            Ok(reply) => reply?,
            Err(_) => {
                debug!(target: "Client", "Query {} ran out of time before its reply", node.tag);
                return Err(EngineError::Timeout);
            }
        };

        match check_reply(reply) {
            Ok(reply) => {
                self.backoff.reset();
                Ok(reply)
            }
            Err(e @ EngineError::RateLimited(_)) => {
                self.backoff.arm();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn execute<S: IqSpec>(&self, spec: &S) -> Result<S::Response> {
        let iq = spec.build_iq();
        let timeout = iq.timeout;
        let reply = self.query(iq.into_node(), timeout).await?;
        spec.parse_response(&reply)
    }

    /// Waits for the element tagged `id` without sending anything.
    pub async fn wait_for_message(&self, id: &str, timeout: Option<Duration>) -> Result<Node> {
        self.correlator
            .wait_for_message(id, timeout.unwrap_or(self.config.default_query_timeout))
            .await
    }

    pub async fn wait_for_socket_open(&self) -> Result<()> {
        self.socket.wait_ready().await
    }

    /// Resolves with the first connection update matching `predicate`.
    pub async fn wait_for_connection_update<P>(
        &self,
        predicate: P,
        timeout: Option<Duration>,
    ) -> Result<ConnectionUpdate>
    where
        P: Fn(&ConnectionUpdate) -> bool,
    {
        let mut updates = self.events.connection_update.subscribe();
        let wait = async {
            loop {
                match updates.recv().await {
                    Ok(update) if predicate(&update) => return Ok(update),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(target: "Client", "Missed {n} connection updates");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(EngineError::ConnectionClosed);
                    }
                }
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| EngineError::Timeout)?,
            None => wait.await,
        }
    }

    /// Unlinks this device when possible, then ends the connection as
    /// logged out.
    pub async fn logout(&self, reason: Option<&str>) {
        if self.is_logged_in() && self.is_ready() {
            let me = self.auth.creds.snapshot().await.me;
            if let Some(me) = me {
                let spec = RemoveCompanionDeviceSpec {
                    jid: me.id,
                    reason: "user_initiated",
                };
                if let Err(e) = self.execute(&spec).await {
                    warn!(target: "Client", "Failed to unlink device: {e}");
                }
            }
        }
        self.end(Some(EngineError::LoggedOut(
            reason.unwrap_or("Intentional Logout").to_string(),
        )));
    }

    /// Logs an error raised outside a caller's control flow and reacts to
    /// the ones that need it: a failed MAC forces a pre-key re-upload, a
    /// rate-limit signal arms the backoff.
    pub fn on_unexpected_error(self: &Arc<Self>, err: &dyn fmt::Display, context: &str) {
        let text = err.to_string();
        error!(target: "Client", "unexpected error in '{context}': {text}");

        let lower = text.to_lowercase();
        if lower.contains("bad mac") || (lower.contains("mac") && lower.contains("invalid")) {
            let client = self.clone();
            tokio::spawn(async move {
                if let Err(e) = client.upload_pre_keys_to_server_if_required(true).await {
                    warn!(target: "Client/PreKeys", "Re-upload after bad mac failed: {e}");
                }
            });
        }
        if lower.contains("429") || lower.contains("rate limit") {
            self.backoff.arm();
        }
    }

    pub(crate) async fn handle_iq(&self, node: &Node) -> bool {
        if node.attr("type") == Some("get") && node.get_optional_child("ping").is_some() {
            info!(target: "Client", "Received ping, sending pong.");
            let pong = NodeBuilder::new("iq")
                .attr("to", node.attr("from").unwrap_or(SERVER_JID))
                .attr("type", "result")
                .opt_attr("id", node.id())
                .build();
            if let Err(e) = self.send_node(&pong).await {
                warn!(target: "Client", "Failed to send pong: {e}");
            }
            return true;
        }
        false
    }

    pub(crate) async fn handle_success(&self, node: &Node) {
        if self.logged_in.swap(true, Ordering::SeqCst) {
            debug!(target: "Client", "Ignoring duplicate <success> stanza (already logged in)");
            return;
        }
        info!(target: "Client", "Successfully authenticated with the server");

        if let Some(lid) = node.attr("lid") {
            match lid.parse::<Jid>() {
                Ok(lid) => {
                    let changed = self
                        .auth
                        .creds
                        .modify(|creds| match creds.me.as_mut() {
                            Some(me) if me.lid.as_ref() != Some(&lid) => {
                                me.lid = Some(lid);
                                true
                            }
                            _ => false,
                        })
                        .await;
                    if changed {
                        self.persist_creds().await;
                    }
                }
                Err(e) => warn!(target: "Client", "Ignoring unparsable lid '{lid}': {e}"),
            }
        }

        self.events.connection_update.emit(ConnectionUpdate {
            connection: Some(ConnectionState::Open),
            is_online: Some(true),
            ..Default::default()
        });
    }

    pub(crate) fn handle_connect_failure(&self, node: &Node) {
        let code = node
            .attr("reason")
            .and_then(|r| r.parse::<u16>().ok())
            .unwrap_or(500);
        let reason = match code {
            401 => DisconnectReason::LoggedOut,
            403 => DisconnectReason::Forbidden,
            503 => DisconnectReason::UnavailableService,
            _ => DisconnectReason::BadSession,
        };
        warn!(target: "Client", "Connect failure: {node}");
        self.end(Some(EngineError::Stream {
            reason,
            message: format!("Connection Failure ({code})"),
        }));
    }

    pub(crate) fn handle_stream_error(&self, node: &Node) {
        let code = node.attr("code").unwrap_or("");
        let conflict = node
            .get_optional_child("conflict")
            .and_then(|c| c.attr("type"))
            .unwrap_or("");

        let (reason, message) = match (code, conflict) {
            (_, "replaced") => (DisconnectReason::ConnectionReplaced, "Connection Replaced"),
            ("515", _) => (DisconnectReason::RestartRequired, "Restart Required"),
            ("401", _) => (DisconnectReason::LoggedOut, "Logged Out"),
            _ => (DisconnectReason::BadSession, "Stream Errored"),
        };
        warn!(target: "Client", "Stream error: {node}");
        self.end(Some(EngineError::Stream {
            reason,
            message: message.to_string(),
        }));
    }

    pub(crate) fn handle_stream_end(&self) {
        warn!(target: "Client", "Received <xmlstreamend/>, treating as disconnect.");
        self.end(Some(EngineError::Stream {
            reason: DisconnectReason::ConnectionClosed,
            message: "Connection Terminated by Server".into(),
        }));
    }

    /// Saves the credentials and publishes them on `creds_update`.
    pub(crate) async fn persist_creds(&self) {
        self.auth.creds.save().await;
        let creds = self.auth.creds.snapshot().await;
        let _ = self.events.creds_update.send(Arc::new(creds));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DisconnectError;
    use crate::test_utils::{MockTransportFactory, connected_client, offline_client, test_config};
    use waengine_core::binary::NodeBuilder;

    fn result_for(node: &Node) -> Node {
        NodeBuilder::new("iq")
            .attr("id", node.id().unwrap())
            .attr("type", "result")
            .build()
    }

    async fn close_error(updates: &mut broadcast::Receiver<ConnectionUpdate>) -> DisconnectError {
        loop {
            let update = updates.recv().await.unwrap();
            if update.connection == Some(ConnectionState::Close) {
                return update.last_disconnect.unwrap().error.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn query_resolves_with_matching_reply() {
        let (client, mut server) = connected_client(test_config()).await;

        let querier = client.clone();
        let query = tokio::spawn(async move {
            let iq = NodeBuilder::new("iq").attr("type", "get").build();
            querier.query(iq, None).await
        });

        let sent = server.next_node().await;
        assert!(sent.id().unwrap().starts_with(client.correlator.prefix()));

        server
            .send_node(&NodeBuilder::new("iq").attr("id", "someone-else").build())
            .await;
        server.send_node(&result_for(&sent)).await;

        let reply = query.await.unwrap().unwrap();
        assert_eq!(reply.id(), sent.id());
        assert_eq!(client.correlator.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn query_times_out_and_deregisters() {
        let (client, mut server) = connected_client(test_config()).await;

        let started = Instant::now();
        let iq = NodeBuilder::new("iq").attr("id", "slow").build();
        let result = client.query(iq, Some(Duration::from_millis(200))).await;

        assert!(matches!(result, Err(EngineError::Timeout)));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(server.next_node().await.id(), Some("slow"));
        assert_eq!(client.correlator.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn query_deadline_includes_backoff_wait() {
        let (client, _server) = connected_client(test_config()).await;
        client.backoff.arm();

        let started = Instant::now();
        let iq = NodeBuilder::new("iq").attr("id", "held").build();
        let result = client.query(iq, Some(Duration::from_millis(200))).await;

        assert!(matches!(result, Err(EngineError::Timeout)));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(client.correlator.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_message_after_end_fails_at_once() {
        let (client, _server) = connected_client(test_config()).await;
        client.end(None);

        let started = Instant::now();
        let result = client.wait_for_message("late", None).await;
        assert!(matches!(result, Err(EngineError::ConnectionClosed)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(client.correlator.pending(), 0);
    }

    #[tokio::test]
    async fn query_before_ready_fails_immediately() {
        let client = offline_client().await;
        let iq = NodeBuilder::new("iq").build();
        assert!(matches!(
            client.query(iq, None).await,
            Err(EngineError::ConnectionClosed)
        ));
        assert_eq!(client.correlator.pending(), 0);
    }

    #[tokio::test]
    async fn error_reply_fails_the_query() {
        let (client, mut server) = connected_client(test_config()).await;

        let querier = client.clone();
        let query = tokio::spawn(async move {
            querier
                .query(NodeBuilder::new("iq").attr("id", "q1").build(), None)
                .await
        });
        let sent = server.next_node().await;
        let error = NodeBuilder::new("iq")
            .attr("id", sent.id().unwrap())
            .attr("type", "error")
            .children([NodeBuilder::new("error")
                .attr("code", "404")
                .attr("text", "item-not-found")
                .build()])
            .build();
        server.send_node(&error).await;

        match query.await.unwrap() {
            Err(EngineError::Protocol { code, text }) => {
                assert_eq!(code, 404);
                assert_eq!(text, "item-not-found");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_reply_delays_the_next_send() {
        let (client, mut server) = connected_client(test_config()).await;

        let querier = client.clone();
        let query = tokio::spawn(async move {
            querier
                .query(NodeBuilder::new("iq").attr("id", "q1").build(), None)
                .await
        });
        let sent = server.next_node().await;
        let limited = NodeBuilder::new("iq")
            .attr("id", sent.id().unwrap())
            .attr("type", "error")
            .children([NodeBuilder::new("error").attr("code", "429").build()])
            .build();
        server.send_node(&limited).await;
        assert!(matches!(
            query.await.unwrap(),
            Err(EngineError::RateLimited(_))
        ));

        let before = Instant::now();
        client
            .send_node(&NodeBuilder::new("presence").build())
            .await
            .unwrap();
        assert!(before.elapsed() >= Duration::from_secs(5));
        assert_eq!(server.next_node().await.tag, "presence");
    }

    #[tokio::test]
    async fn end_is_idempotent_and_fails_pending_requests() {
        let (client, mut server) = connected_client(test_config()).await;
        let mut updates = client.events().connection_update.subscribe();

        let querier = client.clone();
        let query = tokio::spawn(async move {
            querier
                .query(NodeBuilder::new("iq").attr("id", "q1").build(), None)
                .await
        });
        server.next_node().await;

        client.end(Some(EngineError::ConnectionLost));
        client.end(Some(EngineError::Timeout));
        client.end(None);

        assert!(matches!(
            query.await.unwrap(),
            Err(EngineError::ConnectionClosed)
        ));

        let update = updates.recv().await.unwrap();
        assert_eq!(update.connection, Some(ConnectionState::Close));
        let error = update.last_disconnect.unwrap().error.unwrap();
        assert_eq!(error.reason, DisconnectReason::ConnectionLost);
        assert_eq!(error.reason.status_code(), 408);
        assert!(matches!(
            updates.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));

        assert!(client.socket_state().is_closed_or_closing());
        assert!(matches!(
            client.send_node(&NodeBuilder::new("iq").build()).await,
            Err(EngineError::ConnectionClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_past_grace_ends_with_connection_lost() {
        let config = SocketConfig {
            keep_alive_interval: Duration::from_millis(1000),
            keep_alive_grace: Duration::from_millis(5000),
            ..test_config()
        };
        let (client, _server) = connected_client(config).await;
        let mut updates = client.events().connection_update.subscribe();
        let started = Instant::now();

        // pings go unanswered
        let error = close_error(&mut updates).await;
        assert_eq!(error.reason, DisconnectReason::ConnectionLost);
        assert_eq!(error.message, "Connection was lost");
        assert!(started.elapsed() > Duration::from_millis(6000));
        assert!(started.elapsed() < Duration::from_millis(8000));
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_while_traffic_flows() {
        let config = SocketConfig {
            keep_alive_interval: Duration::from_millis(1000),
            ..test_config()
        };
        let (client, mut server) = connected_client(config).await;

        let ping = server.next_node().await;
        assert_eq!(ping.attr("xmlns"), Some("w:p"));
        assert!(ping.get_optional_child("ping").is_some());
        server.send_node(&result_for(&ping)).await;

        let ping = server.next_node().await;
        assert_eq!(ping.attr("xmlns"), Some("w:p"));
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn server_ping_gets_a_pong() {
        let (_client, mut server) = connected_client(test_config()).await;
        let ping = NodeBuilder::new("iq")
            .attr("id", "srv-1")
            .attr("type", "get")
            .attr("from", "s.whatsapp.net")
            .attr("xmlns", "urn:xmpp:ping")
            .children([NodeBuilder::new("ping").build()])
            .build();
        server.send_node(&ping).await;

        let pong = server.next_node().await;
        assert_eq!(pong.tag, "iq");
        assert_eq!(pong.id(), Some("srv-1"));
        assert_eq!(pong.attr("type"), Some("result"));
        assert_eq!(pong.attr("to"), Some("s.whatsapp.net"));
    }

    #[tokio::test]
    async fn replaced_stream_error_ends_with_440() {
        let (client, server) = connected_client(test_config()).await;
        let mut updates = client.events().connection_update.subscribe();
        let error = NodeBuilder::new("stream:error")
            .children([NodeBuilder::new("conflict").attr("type", "replaced").build()])
            .build();
        server.send_node(&error).await;

        let error = close_error(&mut updates).await;
        assert_eq!(error.reason, DisconnectReason::ConnectionReplaced);
        assert_eq!(error.reason.status_code(), 440);
    }

    #[tokio::test]
    async fn failure_stanza_maps_reason_code() {
        let (client, server) = connected_client(test_config()).await;
        let mut updates = client.events().connection_update.subscribe();
        server
            .send_node(&NodeBuilder::new("failure").attr("reason", "401").build())
            .await;

        let error = close_error(&mut updates).await;
        assert_eq!(error.reason, DisconnectReason::LoggedOut);
    }

    #[tokio::test]
    async fn transport_close_ends_the_client() {
        let (client, server) = connected_client(test_config()).await;
        let mut updates = client.events().connection_update.subscribe();
        server.close().await;

        let error = close_error(&mut updates).await;
        assert_eq!(error.reason, DisconnectReason::ConnectionClosed);
        assert_eq!(error.message, "Connection Terminated");
    }

    #[tokio::test]
    async fn elements_are_published_in_arrival_order() {
        let (client, server) = connected_client(test_config()).await;
        let mut frames = client.events().frame.subscribe();
        let mut messages = client.events().message.subscribe();

        for i in 0..5 {
            server
                .send_node(&NodeBuilder::new("message").attr("id", format!("m{i}")).build())
                .await;
        }
        for i in 0..5 {
            assert_eq!(frames.recv().await.unwrap().id(), Some(format!("m{i}").as_str()));
            assert_eq!(messages.recv().await.unwrap().id(), Some(format!("m{i}").as_str()));
        }
    }

    #[tokio::test]
    async fn success_marks_logged_in_and_reports_online() {
        let (client, server) = connected_client(test_config()).await;
        let mut updates = client.events().connection_update.subscribe();
        server.send_node(&NodeBuilder::new("success").build()).await;

        let update = updates.recv().await.unwrap();
        assert_eq!(update.connection, Some(ConnectionState::Open));
        assert_eq!(update.is_online, Some(true));
        assert!(client.is_logged_in());
    }

    #[tokio::test]
    async fn wait_for_connection_update_matches_predicate() {
        let (client, server) = connected_client(test_config()).await;

        let wait = client.wait_for_connection_update(
            |u| u.is_online == Some(true),
            Some(Duration::from_secs(5)),
        );
        let success = NodeBuilder::new("success").build();
        let trigger = server.send_node(&success);
        let (update, ()) = tokio::join!(wait, trigger);
        assert_eq!(update.unwrap().connection, Some(ConnectionState::Open));

        let nothing = client
            .wait_for_connection_update(
                |u| u.is_new_login == Some(true),
                Some(Duration::from_millis(50)),
            )
            .await;
        assert!(matches!(nothing, Err(EngineError::Timeout)));

        client.end(None);
        let closed = client.wait_for_connection_update(|_| true, None).await;
        assert!(matches!(closed, Err(EngineError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn logout_ends_as_logged_out() {
        let (client, _server) = connected_client(test_config()).await;
        let mut updates = client.events().connection_update.subscribe();
        client.logout(None).await;

        let error = close_error(&mut updates).await;
        assert_eq!(error.reason, DisconnectReason::LoggedOut);
        assert_eq!(error.message, "logged out: Intentional Logout");
        assert!(client.is_closed());
        assert!(client.events().connection_update.is_closed());
    }

    #[tokio::test]
    async fn bad_mac_triggers_pre_key_upload() {
        let (client, mut server) = connected_client(test_config()).await;
        client.on_unexpected_error(&"bad mac: message failed to authenticate", "decrypt");

        let upload = server.next_node().await;
        assert_eq!(upload.attr("xmlns"), Some("encrypt"));
        assert_eq!(upload.attr("type"), Some("set"));
        assert_eq!(
            upload
                .get_optional_child("list")
                .unwrap()
                .get_children_by_tag("key")
                .len(),
            30
        );
    }

    #[tokio::test]
    async fn tcp_url_is_rejected_before_dialing() {
        let config = SocketConfig {
            url: "tcp://g.whatsapp.net:5222".into(),
            ..test_config()
        };
        let result = Client::new(
            config,
            AuthState::in_memory(),
            Arc::new(MockTransportFactory::new().0),
        )
        .await;
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[tokio::test]
    async fn wait_for_socket_open_fails_once_closed() {
        let client = offline_client().await;
        client.end(None);
        assert!(matches!(
            client.wait_for_socket_open().await,
            Err(EngineError::ConnectionClosed)
        ));
    }
}
