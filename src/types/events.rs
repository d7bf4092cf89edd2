use crate::error::DisconnectError;
use crate::store::AuthenticationCreds;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use waengine_core::binary::Node;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastDisconnect {
    pub error: Option<DisconnectError>,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionUpdate {
    pub connection: Option<ConnectionState>,
    pub last_disconnect: Option<LastDisconnect>,
    pub is_new_login: Option<bool>,
    pub is_online: Option<bool>,
}

impl ConnectionUpdate {
    pub fn state(connection: ConnectionState) -> Self {
        Self {
            connection: Some(connection),
            ..Default::default()
        }
    }
}

/// The one closable channel: after the terminal update it is shut, and later
/// subscribers see it closed straight away.
#[derive(Debug)]
pub struct ConnectionUpdates {
    sender: Mutex<Option<broadcast::Sender<ConnectionUpdate>>>,
}

impl ConnectionUpdates {
    fn new() -> Self {
        Self {
            sender: Mutex::new(Some(broadcast::channel(CHANNEL_CAPACITY).0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionUpdate> {
        match &*self.sender.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    pub fn emit(&self, update: ConnectionUpdate) {
        if let Some(sender) = &*self.sender.lock().unwrap_or_else(|e| e.into_inner()) {
            let _ = sender.send(update);
        }
    }

    /// Drops the sender; receivers drain what was sent, then see `Closed`.
    pub fn close(&self) {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with one broadcast channel per event kind.
        #[derive(Debug)]
        pub struct EventBus {
            pub connection_update: ConnectionUpdates,
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    connection_update: ConnectionUpdates::new(),
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    // every decoded element, before routing
    (frame, Arc<Node>),

    (message, Arc<Node>),
    (receipt, Arc<Node>),
    (presence, Arc<Node>),
    (notification, Arc<Node>),
    (call, Arc<Node>),

    (creds_update, Arc<AuthenticationCreds>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closing_delivers_buffered_update_then_closes() {
        let updates = ConnectionUpdates::new();
        let mut rx = updates.subscribe();
        updates.emit(ConnectionUpdate::state(ConnectionState::Close));
        updates.close();

        assert_eq!(
            rx.recv().await.unwrap().connection,
            Some(ConnectionState::Close)
        );
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));

        let mut late = updates.subscribe();
        assert!(matches!(
            late.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        updates.emit(ConnectionUpdate::state(ConnectionState::Open));
        assert!(updates.is_closed());
    }
}
