use crate::error::EngineError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, warn};
use rand::RngCore;
use scopeguard::ScopeGuard;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout_at};
use waengine_core::binary::{Attrs, Node, NodeContent};
use waengine_core::jid::Jid;

/// Represents the type of an IQ stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoQueryType {
    Set,
    Get,
}

impl InfoQueryType {
    fn as_str(&self) -> &'static str {
        match self {
            InfoQueryType::Set => "set",
            InfoQueryType::Get => "get",
        }
    }
}

/// Defines an IQ request to be sent to the server.
#[derive(Debug, Clone)]
pub struct InfoQuery<'a> {
    pub namespace: &'a str,
    pub query_type: InfoQueryType,
    pub to: Jid,
    pub id: Option<String>,
    pub content: Option<NodeContent>,
    pub timeout: Option<Duration>,
}

impl<'a> InfoQuery<'a> {
    pub fn get(namespace: &'a str, to: Jid, content: Option<NodeContent>) -> Self {
        Self {
            namespace,
            query_type: InfoQueryType::Get,
            to,
            id: None,
            content,
            timeout: None,
        }
    }

    pub fn set(namespace: &'a str, to: Jid, content: Option<NodeContent>) -> Self {
        Self {
            query_type: InfoQueryType::Set,
            ..Self::get(namespace, to, content)
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds the `<iq>` node. The id is left out when none was given so the
    /// caller can assign a fresh tag.
    pub fn into_node(self) -> Node {
        let mut attrs = Attrs::new();
        if let Some(id) = self.id {
            attrs.insert("id".into(), id);
        }
        attrs.insert("xmlns".into(), self.namespace.into());
        attrs.insert("type".into(), self.query_type.as_str().into());
        attrs.insert("to".into(), self.to.to_string());
        Node::new("iq", attrs, self.content)
    }
}

/// Fails a reply that carries an `<error>` child.
pub fn check_reply(node: Node) -> Result<Node, EngineError> {
    match node.error_details() {
        None => Ok(node),
        Some((429, text)) => Err(EngineError::RateLimited(text)),
        Some((code, text)) => Err(EngineError::Protocol { code, text }),
    }
}

type Reply = Result<Node, EngineError>;
type Waiters = DashMap<String, oneshot::Sender<Reply>>;

fn remove_waiter((waiters, id): (Arc<Waiters>, String)) {
    waiters.remove(&id);
}

/// A registered waiter. Dropping it, whether resolved, timed out or
/// cancelled, removes the registration.
pub struct PendingRequest {
    id: String,
    rx: oneshot::Receiver<Reply>,
    _cleanup: ScopeGuard<(Arc<Waiters>, String), fn((Arc<Waiters>, String))>,
}

impl PendingRequest {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(self, limit: Duration) -> Reply {
        self.wait_until(Instant::now() + limit).await
    }

    /// Waits for the reply until `deadline`, measured from whenever the
    /// caller fixed it rather than from this call.
    pub async fn wait_until(self, deadline: Instant) -> Reply {
        match timeout_at(deadline, self.rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(EngineError::ConnectionClosed),
            Err(_) => {
                debug!(target: "Client/Request", "Request {} timed out", self.id);
                Err(EngineError::Timeout)
            }
        }
    }
}

/// Matches replies to outstanding requests by their `id` attribute.
pub struct RequestCorrelator {
    prefix: String,
    epoch: AtomicU64,
    waiters: Arc<Waiters>,
    closed: AtomicBool,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        let mut rng = rand::rng();
        let prefix = format!("{}.{}-", rng.next_u32() as u16, rng.next_u32() as u16);
        Self {
            prefix,
            epoch: AtomicU64::new(1),
            waiters: Arc::new(DashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn generate_tag(&self) -> String {
        let n = self.epoch.fetch_add(1, Ordering::Relaxed);
        format!("{}{n}", self.prefix)
    }

    /// Registers a waiter for `id`. Only one waiter per id may exist, and
    /// none once the correlator is closed.
    pub fn register(&self, id: impl Into<String>) -> Result<PendingRequest, EngineError> {
        if self.is_closed() {
            return Err(EngineError::ConnectionClosed);
        }
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        match self.waiters.entry(id.clone()) {
            Entry::Occupied(_) => return Err(EngineError::DuplicateRequest(id)),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        let cleanup = scopeguard::guard(
            (self.waiters.clone(), id.clone()),
            remove_waiter as fn((Arc<Waiters>, String)),
        );
        // a close that raced the insert may already have drained the map
        if self.is_closed() {
            return Err(EngineError::ConnectionClosed);
        }
        Ok(PendingRequest {
            id,
            rx,
            _cleanup: cleanup,
        })
    }

    /// Waits for the element tagged `id` without sending anything.
    pub async fn wait_for_message(&self, id: &str, deadline: Duration) -> Reply {
        self.register(id)?.wait(deadline).await
    }

    /// Hands `node` to the waiter registered for its id. Returns whether
    /// someone was waiting.
    pub fn resolve(&self, node: &Node) -> bool {
        let Some(id) = node.id() else {
            return false;
        };
        match self.waiters.remove(id) {
            Some((_, tx)) => {
                if tx.send(Ok(node.clone())).is_err() {
                    debug!(target: "Client/Request", "Waiter for {id} went away before its reply");
                }
                true
            }
            None => false,
        }
    }

    /// Fails every waiter with `ConnectionClosed` and refuses new ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.fail_all(&EngineError::ConnectionClosed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fails every outstanding waiter with `err`.
    pub fn fail_all(&self, err: &EngineError) {
        let ids: Vec<String> = self.waiters.iter().map(|e| e.key().clone()).collect();
        if !ids.is_empty() {
            warn!(target: "Client/Request", "Failing {} pending requests: {err}", ids.len());
        }
        for id in ids {
            if let Some((_, tx)) = self.waiters.remove(&id) {
                let _ = tx.send(Err(err.duplicate()));
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.waiters.len()
    }
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}
