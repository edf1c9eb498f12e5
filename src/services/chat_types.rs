use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;

// ── Stored types ───────────────────────────────────────────────

/// Conversation kind. Only `Direct` lacks an intrinsic title.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationKind {
    Event,
    Department,
    Issue,
    Group,
    Direct,
}

/// A conversation as listed for the active scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub kind: ConversationKind,
    #[serde(default)]
    pub title: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// Authoritative "everyone has read" flag, when the server supplies one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_read: Option<bool>,
}

/// Conversation member snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
    #[serde(default)]
    pub last_read_at: Option<DateTime<Utc>>,
}

/// Locally generated attachment identity. Never sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalId(uuid::Uuid);

impl LocalId {
    const PREFIX: &'static str = "local:";

    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.0)
    }
}

/// Attachment identity: server-assigned, or a local placeholder id in its own
/// namespace (`local:<uuid>`), so the two can never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum AttachmentId {
    Server(String),
    Local(LocalId),
}

impl AttachmentId {
    pub fn server_id(&self) -> Option<&str> {
        match self {
            AttachmentId::Server(id) => Some(id),
            AttachmentId::Local(_) => None,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, AttachmentId::Local(_))
    }
}

impl From<AttachmentId> for String {
    fn from(id: AttachmentId) -> Self {
        match id {
            AttachmentId::Server(id) => id,
            AttachmentId::Local(local) => local.to_string(),
        }
    }
}

impl From<String> for AttachmentId {
    fn from(raw: String) -> Self {
        match raw
            .strip_prefix(LocalId::PREFIX)
            .and_then(|rest| uuid::Uuid::parse_str(rest).ok())
        {
            Some(uuid) => AttachmentId::Local(LocalId(uuid)),
            None => AttachmentId::Server(raw),
        }
    }
}

/// File attached to a message.
///
/// Placeholders start as `uploading = true, progress = 0`, receive monotonic
/// progress updates, and end either finalized (`object_key` set) or failed
/// (`uploading = false`, no `object_key`, `error` set).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: AttachmentId,
    pub original_name: String,
    pub mime_type: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub object_key: Option<String>,
    #[serde(default)]
    pub uploading: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Attachment {
    pub fn placeholder(local_id: LocalId, file: &UploadFile) -> Self {
        Self {
            id: AttachmentId::Local(local_id),
            original_name: file.name.clone(),
            mime_type: file.mime_type.clone(),
            size: file.size,
            object_key: None,
            uploading: true,
            progress: Some(0),
            error: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        !self.uploading && self.object_key.is_some()
    }
}

/// A chat message. Immutable once stored except for its attachment list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub author_id: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_read: Option<bool>,
}

impl Message {
    /// Total order used by every timeline: `created_at`, then `id`.
    pub fn timeline_order(&self, other: &Message) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }

    /// Attachment ids the server knows about; local placeholders are skipped.
    pub fn server_attachment_ids(&self) -> Vec<&str> {
        self.attachments
            .iter()
            .filter_map(|a| a.id.server_id())
            .collect()
    }

    /// Text shown in the conversation list.
    pub fn preview_text(&self) -> String {
        match self.body.as_deref() {
            Some(body) if !body.trim().is_empty() => body.to_string(),
            _ => self
                .attachments
                .iter()
                .map(|a| a.original_name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

/// Last-message preview for the conversation list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessagePreview {
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Backward pagination cursor for one conversation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaginationCursor {
    pub earliest_loaded_created_at: Option<DateTime<Utc>>,
    pub has_more: bool,
}

/// Per-conversation load state of the timeline.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LoadState {
    #[default]
    Unloaded,
    Loading,
    Loaded,
}

// ── Wire protocol types ────────────────────────────────────────

/// One page of message history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    #[serde(default)]
    pub items: Vec<Message>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Attachment list broadcast by the server for one message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentUpdate {
    pub conversation_id: String,
    pub message_id: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Read mark broadcast by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadMark {
    pub conversation_id: String,
    pub user_id: String,
    pub read_at: DateTime<Utc>,
}

/// Inbound live-channel events, dispatched through a single handler.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    MessageNew(Message),
    AttachmentUpdate(AttachmentUpdate),
    ReadMarked(ReadMark),
    ConnectError(String),
}

/// Stored-object reference returned by the attachment store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    pub id: String,
    pub original_name: String,
    pub mime_type: String,
    pub object_key: String,
    #[serde(default)]
    pub size: Option<u64>,
}

impl From<StoredObject> for Attachment {
    fn from(obj: StoredObject) -> Self {
        Self {
            id: AttachmentId::Server(obj.id),
            original_name: obj.original_name,
            mime_type: obj.mime_type,
            size: obj.size,
            object_key: Some(obj.object_key),
            uploading: false,
            progress: Some(100),
            error: None,
        }
    }
}

/// Where the bytes of an upload come from.
#[derive(Debug, Clone)]
pub enum UploadSource {
    Memory(Vec<u8>),
    Path(PathBuf),
}

/// A file queued for upload.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub mime_type: String,
    pub size: Option<u64>,
    pub source: UploadSource,
}

impl UploadFile {
    pub fn from_bytes(name: &str, bytes: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            mime_type: guess_mime(name),
            size: Some(bytes.len() as u64),
            source: UploadSource::Memory(bytes),
        }
    }

    pub async fn from_path(path: PathBuf) -> std::io::Result<Self> {
        let meta = tokio::fs::metadata(&path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self {
            mime_type: guess_mime(&name),
            name,
            size: Some(meta.len()),
            source: UploadSource::Path(path),
        })
    }
}

fn guess_mime(name: &str) -> String {
    mime_guess::from_path(name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

// ── UI events ──────────────────────────────────────────────────

/// Live connection state, readable by the UI.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", content = "message", rename_all = "camelCase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

/// Change notifications for the UI; state is re-read after each one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChatEvent {
    DirectoryChanged,
    #[serde(rename_all = "camelCase")]
    TimelineChanged { conversation_id: String },
    #[serde(rename_all = "camelCase")]
    ParticipantsChanged { conversation_id: String },
    #[serde(rename_all = "camelCase")]
    AttachmentProgress {
        conversation_id: String,
        message_id: String,
        attachment_id: String,
        progress: u8,
    },
    ConnectionChanged { state: ConnectionState },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_message_with_attachments() {
        let json = r#"{
            "id": "m1",
            "conversationId": "c1",
            "authorId": "u1",
            "body": "hello",
            "createdAt": "2024-03-01T10:00:00Z",
            "attachments": [
                {"id": "a1", "originalName": "plan.pdf", "mimeType": "application/pdf",
                 "objectKey": "scopes/e1/plan.pdf", "size": 2048}
            ]
        }"#;

        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.id, "m1");
        assert_eq!(msg.attachments.len(), 1);
        assert_eq!(msg.attachments[0].id, AttachmentId::Server("a1".to_string()));
        assert!(msg.attachments[0].is_finalized());
        assert!(msg.parent_id.is_none());
        assert!(msg.all_read.is_none());
    }

    #[test]
    fn test_parse_conversation_kinds() {
        let json = r#"[
            {"id": "c1", "kind": "EVENT", "title": "Kickoff", "updatedAt": "2024-03-01T10:00:00Z"},
            {"id": "c2", "kind": "DIRECT", "updatedAt": "2024-03-01T10:00:00Z", "allRead": true}
        ]"#;

        let convs: Vec<Conversation> = serde_json::from_str(json).unwrap();
        assert_eq!(convs[0].kind, ConversationKind::Event);
        assert_eq!(convs[1].kind, ConversationKind::Direct);
        assert!(convs[1].title.is_none());
        assert_eq!(convs[1].all_read, Some(true));
    }

    #[test]
    fn test_local_ids_stay_in_their_namespace() {
        let local = AttachmentId::Local(LocalId::new());
        let raw: String = local.clone().into();
        assert!(raw.starts_with("local:"));
        assert_eq!(AttachmentId::from(raw), local);
        assert!(local.server_id().is_none());

        let server = AttachmentId::from("local-but-not-really".to_string());
        assert_eq!(server.server_id(), Some("local-but-not-really"));
    }

    #[test]
    fn test_server_attachment_ids_skip_placeholders() {
        let file = UploadFile::from_bytes("a.png", vec![1, 2, 3]);
        let mut msg: Message = serde_json::from_str(
            r#"{"id": "m1", "conversationId": "c1", "authorId": "u1",
                "createdAt": "2024-03-01T10:00:00Z",
                "attachments": [{"id": "a1", "originalName": "x", "mimeType": "text/plain"}]}"#,
        )
        .unwrap();
        msg.attachments
            .push(Attachment::placeholder(LocalId::new(), &file));

        assert_eq!(msg.server_attachment_ids(), vec!["a1"]);
        assert_eq!(msg.attachments[1].mime_type, "image/png");
        assert_eq!(msg.attachments[1].progress, Some(0));
    }

    #[test]
    fn test_timeline_order_breaks_ties_by_id() {
        let at = "2024-03-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let mk = |id: &str| Message {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            author_id: "u1".to_string(),
            body: None,
            parent_id: None,
            created_at: at,
            attachments: Vec::new(),
            all_read: None,
        };
        assert_eq!(mk("a").timeline_order(&mk("b")), Ordering::Less);
        assert_eq!(mk("b").timeline_order(&mk("b")), Ordering::Equal);
    }

    #[test]
    fn test_chat_event_serialization() {
        let event = ChatEvent::TimelineChanged {
            conversation_id: "c1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "timelineChanged");
        assert_eq!(json["conversationId"], "c1");

        let state = serde_json::to_value(ConnectionState::Error("auth rejected".into())).unwrap();
        assert_eq!(state["status"], "error");
        assert_eq!(state["message"], "auth rejected");
    }
}
