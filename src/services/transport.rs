//! Seams between the engine and the outside world.
//!
//! The engine only talks to these traits; `http_api`, `live_channel` and
//! `attachment_store` hold the network implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::chat_types::{
    Conversation, LiveEvent, Message, MessagePage, Participant, StoredObject, UploadFile,
};
use crate::error::Result;

/// Request/response channel for bulk fetches.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_conversations(&self, scope: &str) -> Result<Vec<Conversation>>;
    async fn list_messages(
        &self,
        conversation_id: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<MessagePage>;
    async fn list_participants(&self, conversation_id: &str) -> Result<Vec<Participant>>;
    async fn mark_read(&self, conversation_id: &str) -> Result<()>;
    /// Fallback send used while the live channel is down.
    async fn create_message(&self, conversation_id: &str, body: &str) -> Result<Message>;
}

/// An open persistent channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LiveChannel: Send + Sync {
    fn is_connected(&self) -> bool;
    async fn join(&self, conversation_id: &str) -> Result<()>;
    /// Emits `message.send` and waits for the server acknowledgment.
    async fn send_message(&self, conversation_id: &str, body: &str) -> Result<Message>;
    async fn attachment_uploaded(&self, message_id: &str) -> Result<()>;
    async fn mark_read(&self, conversation_id: &str) -> Result<()>;
    async fn close(&self);
}

/// Opens persistent channels. Inbound events are pushed into `events`; the
/// channel ends when the sender is dropped.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn open(
        &self,
        credential: &str,
        scope: &str,
        events: mpsc::UnboundedSender<LiveEvent>,
    ) -> Result<Arc<dyn LiveChannel>>;
}

/// Binary upload service. Progress percentages are pushed into `progress`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn upload(
        &self,
        scope_id: &str,
        target_type: &str,
        target_id: &str,
        file: UploadFile,
        progress: mpsc::UnboundedSender<u8>,
    ) -> Result<StoredObject>;
}

/// Current user and bearer credential.
pub trait IdentityProvider: Send + Sync {
    fn current_user_id(&self) -> Option<String>;
    fn credential(&self) -> Option<String>;
}

/// Active conversation scope (event id).
pub trait ContextResolver: Send + Sync {
    fn active_scope(&self) -> Option<String>;
}

/// Identity fixed at construction time.
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    pub user_id: String,
    pub credential: String,
}

impl IdentityProvider for StaticIdentity {
    fn current_user_id(&self) -> Option<String> {
        Some(self.user_id.clone())
    }

    fn credential(&self) -> Option<String> {
        Some(self.credential.clone())
    }
}

/// Scope that can be switched at runtime.
#[derive(Debug, Default)]
pub struct StaticContext {
    scope: std::sync::RwLock<Option<String>>,
}

impl StaticContext {
    pub fn new(scope: Option<String>) -> Self {
        Self {
            scope: std::sync::RwLock::new(scope),
        }
    }

    pub fn set_scope(&self, scope: Option<String>) {
        if let Ok(mut guard) = self.scope.write() {
            *guard = scope;
        }
    }
}

impl ContextResolver for StaticContext {
    fn active_scope(&self) -> Option<String> {
        self.scope.read().ok().and_then(|s| s.clone())
    }
}
