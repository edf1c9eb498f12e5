//! WebSocket implementation of the live channel.
//!
//! Frames are JSON objects `{"event": ..., "data": ..., "ackId": n}`.
//! Requests that expect an answer carry an `ackId`; the server answers with an
//! `ack` frame carrying the same id.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::chat_types::{AttachmentUpdate, LiveEvent, Message, ReadMark};
use super::transport::{LiveChannel, LiveConnector};
use crate::error::{Result, SyncError};

pub const EVENT_JOIN: &str = "conversation.join";
pub const EVENT_SEND: &str = "message.send";
pub const EVENT_ATTACHMENT_UPLOADED: &str = "attachment.uploaded";
pub const EVENT_READ: &str = "conversation.read";
pub const EVENT_MESSAGE_NEW: &str = "message.new";
pub const EVENT_MESSAGE_ATTACHMENT: &str = "message.attachment";
pub const EVENT_ACK: &str = "ack";

/// One frame on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<u64>,
}

/// What an inbound frame means to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(LiveEvent),
    Ack { ack_id: u64, data: serde_json::Value },
    Ignored(String),
}

/// Decode an inbound text frame.
pub fn decode_frame(text: &str) -> Result<Inbound> {
    let frame: Frame = serde_json::from_str(text)?;
    let inbound = match frame.event.as_str() {
        EVENT_MESSAGE_NEW => Inbound::Event(LiveEvent::MessageNew(serde_json::from_value::<
            Message,
        >(frame.data)?)),
        EVENT_MESSAGE_ATTACHMENT => Inbound::Event(LiveEvent::AttachmentUpdate(
            serde_json::from_value::<AttachmentUpdate>(frame.data)?,
        )),
        EVENT_READ => Inbound::Event(LiveEvent::ReadMarked(serde_json::from_value::<ReadMark>(
            frame.data,
        )?)),
        EVENT_ACK => match frame.ack_id {
            Some(ack_id) => Inbound::Ack {
                ack_id,
                data: frame.data,
            },
            None => Inbound::Ignored("ack without ackId".to_string()),
        },
        other => Inbound::Ignored(other.to_string()),
    };
    Ok(inbound)
}

type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>>;

/// Opens WebSocket live channels against `ws_url`.
pub struct WsConnector {
    ws_url: String,
    ack_timeout: Duration,
}

impl WsConnector {
    pub fn new(ws_url: &str, ack_timeout: Duration) -> Self {
        Self {
            ws_url: ws_url.to_string(),
            ack_timeout,
        }
    }

    fn request_url(&self, scope: &str) -> Result<url::Url> {
        let mut url = url::Url::parse(&self.ws_url)
            .map_err(|e| SyncError::Config(format!("Invalid live channel URL: {}", e)))?;
        url.query_pairs_mut().append_pair("scope", scope);
        Ok(url)
    }
}

#[async_trait]
impl LiveConnector for WsConnector {
    async fn open(
        &self,
        credential: &str,
        scope: &str,
        events: mpsc::UnboundedSender<LiveEvent>,
    ) -> Result<Arc<dyn LiveChannel>> {
        let url = self.request_url(scope)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| SyncError::Transport(format!("Build request: {}", e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential))
            .map_err(|e| SyncError::Transport(format!("Invalid credential: {}", e)))?;
        request.headers_mut().insert("Authorization", bearer);

        let (ws_stream, _) = tokio::time::timeout(
            self.ack_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| SyncError::Transport("Connect timed out".to_string()))?
        .map_err(|e| SyncError::Transport(format!("Connect: {}", e)))?;

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let connected = Arc::new(AtomicBool::new(true));
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));

        // Write task
        let write_connected = connected.clone();
        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(WsMessage::Text(text)).await {
                    log::warn!("Live channel write failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
            write_connected.store(false, Ordering::SeqCst);
        });

        // Read task
        let read_connected = connected.clone();
        let read_pending = pending.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => match decode_frame(&text) {
                        Ok(Inbound::Event(event)) => {
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                        Ok(Inbound::Ack { ack_id, data }) => {
                            if let Some(tx) = read_pending.lock().await.remove(&ack_id) {
                                let _ = tx.send(data);
                            }
                        }
                        Ok(Inbound::Ignored(event)) => {
                            log::debug!("Ignoring live event {}", event);
                        }
                        Err(e) => log::warn!("Malformed live frame: {}", e),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        let _ = events.send(LiveEvent::ConnectError(e.to_string()));
                        break;
                    }
                }
            }
            read_connected.store(false, Ordering::SeqCst);
            // Wake every waiter; their senders drop here.
            read_pending.lock().await.clear();
            log::info!("Live channel read loop ended");
        });

        Ok(Arc::new(WsLiveChannel {
            out_tx,
            connected,
            pending,
            next_ack: AtomicU64::new(1),
            ack_timeout: self.ack_timeout,
            tasks: std::sync::Mutex::new(vec![writer, reader]),
        }))
    }
}

pub struct WsLiveChannel {
    out_tx: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
    pending: PendingAcks,
    next_ack: AtomicU64,
    ack_timeout: Duration,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WsLiveChannel {
    fn emit(&self, event: &str, data: serde_json::Value, ack_id: Option<u64>) -> Result<()> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let frame = Frame {
            event: event.to_string(),
            data,
            ack_id,
        };
        let text = serde_json::to_string(&frame)?;
        self.out_tx
            .send(text)
            .map_err(|_| SyncError::NotConnected)
    }

    async fn request(&self, event: &str, data: serde_json::Value) -> Result<serde_json::Value> {
        let ack_id = self.next_ack.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(ack_id, tx);

        if let Err(e) = self.emit(event, data, Some(ack_id)) {
            self.pending.lock().await.remove(&ack_id);
            return Err(e);
        }

        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(_)) => Err(SyncError::Transport(format!(
                "Channel closed before {} was acknowledged",
                event
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&ack_id);
                Err(SyncError::Transport(format!("{} not acknowledged in time", event)))
            }
        }
    }
}

#[async_trait]
impl LiveChannel for WsLiveChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn join(&self, conversation_id: &str) -> Result<()> {
        self.emit(
            EVENT_JOIN,
            serde_json::json!({ "conversationId": conversation_id }),
            None,
        )
    }

    async fn send_message(&self, conversation_id: &str, body: &str) -> Result<Message> {
        let data = self
            .request(
                EVENT_SEND,
                serde_json::json!({ "conversationId": conversation_id, "body": body }),
            )
            .await
            .map_err(|e| SyncError::Send(e.to_string()))?;
        if let Some(err) = data.get("error").and_then(|e| e.as_str()) {
            return Err(SyncError::Send(err.to_string()));
        }
        serde_json::from_value(data).map_err(|e| SyncError::Send(format!("Parse ack: {}", e)))
    }

    async fn attachment_uploaded(&self, message_id: &str) -> Result<()> {
        self.emit(
            EVENT_ATTACHMENT_UPLOADED,
            serde_json::json!({ "messageId": message_id }),
            None,
        )
    }

    async fn mark_read(&self, conversation_id: &str) -> Result<()> {
        self.emit(
            EVENT_READ,
            serde_json::json!({ "conversationId": conversation_id }),
            None,
        )
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            task.abort();
        }
        self.pending.lock().await.clear();
    }
}
