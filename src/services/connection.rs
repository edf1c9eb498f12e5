//! Owner of the single persistent channel.
//!
//! Only this manager opens or closes the underlying channel. The channel is
//! keyed by `(credential, scope)`; asking again with the same key while
//! connected returns the live handle instead of opening a second one.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use super::chat_types::{ConnectionState, LiveEvent};
use super::transport::{LiveChannel, LiveConnector};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionKey {
    pub credential: String,
    pub scope: String,
}

/// Cheap handle to the live channel.
#[derive(Clone)]
pub struct ConnectionHandle {
    key: ConnectionKey,
    channel: Arc<dyn LiveChannel>,
}

impl ConnectionHandle {
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn channel(&self) -> &Arc<dyn LiveChannel> {
        &self.channel
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("scope", &self.key.scope)
            .field("connected", &self.channel.is_connected())
            .finish()
    }
}

struct ActiveConnection {
    handle: ConnectionHandle,
    pump: JoinHandle<()>,
}

pub struct ConnectionManager {
    connector: Arc<dyn LiveConnector>,
    active: Mutex<Option<ActiveConnection>>,
    events_tx: broadcast::Sender<LiveEvent>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn LiveConnector>) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            active: Mutex::new(None),
            events_tx,
            state_tx,
        }
    }

    /// Receive inbound events. Events are not buffered for subscribers that
    /// attach later, so subscribe before joining conversations.
    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.events_tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.events_tx.receiver_count()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Current handle, if a channel is open and connected.
    pub async fn current(&self) -> Option<ConnectionHandle> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|a| a.handle.clone())
            .filter(|h| h.is_connected())
    }

    /// Connect for `(credential, scope)`. Failures land in
    /// [`ConnectionState::Error`] and return `None`; retrying is up to the caller.
    pub async fn connect(&self, credential: &str, scope: &str) -> Option<ConnectionHandle> {
        let key = ConnectionKey {
            credential: credential.to_string(),
            scope: scope.to_string(),
        };

        let mut active = self.active.lock().await;
        if let Some(existing) = active.as_ref() {
            if existing.handle.key == key && existing.handle.is_connected() {
                return Some(existing.handle.clone());
            }
        }
        if let Some(previous) = active.take() {
            log::info!("Closing live channel for scope {}", previous.handle.key.scope);
            Self::teardown(previous).await;
        }

        self.state_tx.send_replace(ConnectionState::Connecting);
        let (tx, rx) = mpsc::unbounded_channel();
        match self.connector.open(credential, scope, tx).await {
            Ok(channel) => {
                log::info!("Live channel connected for scope {}", scope);
                let handle = ConnectionHandle { key, channel };
                let pump = self.spawn_pump(rx);
                *active = Some(ActiveConnection {
                    handle: handle.clone(),
                    pump,
                });
                self.state_tx.send_replace(ConnectionState::Connected);
                Some(handle)
            }
            Err(e) => {
                log::warn!("Live channel connect failed for scope {}: {}", scope, e);
                self.state_tx
                    .send_replace(ConnectionState::Error(e.to_string()));
                None
            }
        }
    }

    /// Close the channel if one is open. Safe to call at any time.
    pub async fn disconnect(&self) {
        let previous = self.active.lock().await.take();
        if let Some(previous) = previous {
            log::info!("Disconnecting live channel for scope {}", previous.handle.key.scope);
            Self::teardown(previous).await;
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    async fn teardown(connection: ActiveConnection) {
        connection.pump.abort();
        connection.handle.channel.close().await;
    }

    /// Forward connector events to subscribers and track channel health.
    fn spawn_pump(&self, mut rx: mpsc::UnboundedReceiver<LiveEvent>) -> JoinHandle<()> {
        let events_tx = self.events_tx.clone();
        let state_tx = self.state_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let LiveEvent::ConnectError(reason) = &event {
                    state_tx.send_replace(ConnectionState::Error(reason.clone()));
                }
                // No subscribers is not an error; the event is simply dropped.
                let _ = events_tx.send(event);
            }
            state_tx.send_if_modified(|state| {
                if *state == ConnectionState::Connected {
                    *state = ConnectionState::Disconnected;
                    true
                } else {
                    false
                }
            });
        })
    }
}
