use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

use crate::error::Result;
use crate::services::chat_types::*;
use crate::services::uploads::UploadReport;
use crate::services::viewport::{ScrollCommand, ViewportMetrics};
use crate::state::AppState;

/// Conversation list row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub kind: ConversationKind,
    pub display_name: String,
    pub updated_at: DateTime<Utc>,
    pub preview: Option<MessagePreview>,
}

/// What the message list renders, plus how to scroll afterwards.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineView {
    pub messages: Vec<Message>,
    pub cursor: PaginationCursor,
    pub load_state: LoadState,
    pub scroll: ScrollCommand,
}

// ── Scope & connection ───────────────────────────────────────

/// Switch to `scope`, reconnect the live channel and load its conversations.
pub async fn open_scope(state: &AppState, scope: String) -> Result<Vec<ConversationSummary>> {
    state.context.set_scope(Some(scope.clone()));
    state.chat.connect().await;

    if let Err(e) = state.chat.load_conversations(&scope).await {
        log::warn!("Failed to load conversations for {}: {}", scope, e);
    }
    Ok(get_conversations(state).await)
}

pub async fn get_connection_state(state: &AppState) -> ConnectionState {
    state.chat.connection_state()
}

pub async fn disconnect(state: &AppState) {
    state.chat.disconnect().await;
}

// ── Conversation list ────────────────────────────────────────

pub async fn get_conversations(state: &AppState) -> Vec<ConversationSummary> {
    let mut rows = Vec::new();
    for conv in state.chat.conversations().await {
        let display_name = state
            .chat
            .display_name(&conv.id)
            .await
            .unwrap_or_else(|| conv.id.clone());
        let preview = state.chat.preview(&conv.id).await;
        rows.push(ConversationSummary {
            id: conv.id,
            kind: conv.kind,
            display_name,
            updated_at: conv.updated_at,
            preview,
        });
    }
    rows
}

pub async fn get_participants(state: &AppState, conversation_id: String) -> Vec<Participant> {
    state
        .chat
        .participants(&conversation_id)
        .await
        .unwrap_or_else(|e| {
            log::warn!("Failed to load participants of {}: {}", conversation_id, e);
            Vec::new()
        })
}

// ── Timeline ─────────────────────────────────────────────────

/// Show a conversation: save the outgoing scroll offset, load the newest
/// page and decide where the list starts.
pub async fn open_conversation(
    state: &AppState,
    conversation_id: String,
    current_offset: Option<f64>,
) -> Result<TimelineView> {
    state
        .viewport
        .write()
        .await
        .switch_to(Some(&conversation_id), current_offset)?;

    let page_size = state.chat.settings().page_size;
    let scroll = match state.chat.load_initial(&conversation_id, page_size).await {
        Ok(_) => state.viewport.write().await.on_first_load(&conversation_id),
        Err(e) => {
            log::warn!("Failed to load messages of {}: {}", conversation_id, e);
            ScrollCommand::Stay
        }
    };
    Ok(timeline_view(state, &conversation_id, scroll).await)
}

/// Fetch the previous page. `metrics` is the viewport right before the
/// prepend; follow up with [`restore_scroll_after_prepend`] once rendered.
pub async fn load_older_messages(
    state: &AppState,
    conversation_id: String,
    metrics: ViewportMetrics,
) -> TimelineView {
    state.viewport.write().await.begin_prepend(metrics);
    if let Err(e) = state.chat.load_older(&conversation_id).await {
        log::warn!("Failed to load older messages of {}: {}", conversation_id, e);
    }
    timeline_view(state, &conversation_id, ScrollCommand::Stay).await
}

pub async fn restore_scroll_after_prepend(
    state: &AppState,
    metrics: ViewportMetrics,
) -> ScrollCommand {
    state.viewport.write().await.finish_prepend(metrics)
}

/// Viewport snapshot taken before a live change is rendered.
pub async fn before_timeline_change(state: &AppState, metrics: ViewportMetrics) {
    state.viewport.write().await.before_change(metrics);
}

/// Where to scroll after a live change rendered.
pub async fn after_timeline_change(state: &AppState, conversation_id: String) -> ScrollCommand {
    let messages = state.chat.messages(&conversation_id).await;
    let newest_is_own = match (messages.last(), state.chat.current_user_id()) {
        (Some(newest), Some(me)) => newest.author_id == me,
        _ => false,
    };
    state.viewport.read().await.after_change(newest_is_own)
}

pub async fn record_scroll_position(state: &AppState, conversation_id: String, offset: f64) {
    state
        .viewport
        .write()
        .await
        .record_scroll(&conversation_id, offset);
}

/// Leaving the message view altogether.
pub async fn close_conversation(state: &AppState, current_offset: Option<f64>) -> Result<()> {
    state.viewport.write().await.switch_to(None, current_offset)
}

async fn timeline_view(
    state: &AppState,
    conversation_id: &str,
    scroll: ScrollCommand,
) -> TimelineView {
    TimelineView {
        messages: state.chat.messages(conversation_id).await.to_vec(),
        cursor: state.chat.cursor(conversation_id).await,
        load_state: state.chat.load_state(conversation_id).await,
        scroll,
    }
}

// ── Sending ──────────────────────────────────────────────────

pub async fn send_chat_message(
    state: &AppState,
    conversation_id: String,
    text: String,
) -> Result<Message> {
    state.chat.send_message(&conversation_id, &text).await
}

/// Send local files as one message. `caption` becomes the message body.
pub async fn send_chat_files(
    state: &AppState,
    conversation_id: String,
    caption: String,
    paths: Vec<PathBuf>,
) -> Result<UploadReport> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        files.push(UploadFile::from_path(path).await?);
    }
    state
        .chat
        .send_files(&conversation_id, &caption, files)
        .await
}

pub async fn cancel_chat_upload(state: &AppState, message_id: String) -> Result<()> {
    state.chat.cancel_upload(&message_id).await
}

// ── Read receipts ────────────────────────────────────────────

pub async fn mark_conversation_read(state: &AppState, conversation_id: String) {
    if let Err(e) = state.chat.mark_read(&conversation_id).await {
        log::warn!("Failed to mark {} read: {}", conversation_id, e);
    }
}

pub async fn get_read_state(state: &AppState, conversation_id: String, message_id: String) -> bool {
    state.chat.read_state(&conversation_id, &message_id).await
}
