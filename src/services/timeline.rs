use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use super::chat_types::{
    Attachment, AttachmentId, LoadState, LocalId, Message, PaginationCursor, StoredObject,
};

/// One conversation's slice of the timeline.
///
/// `messages` is shared with readers; it is only replaced when its content
/// actually changes, so an unchanged `Arc` means nothing to re-render.
#[derive(Debug, Clone, Default)]
pub struct ConversationTimeline {
    pub state: LoadState,
    pub messages: Arc<Vec<Message>>,
    pub cursor: PaginationCursor,
}

/// Per-conversation ordered message log.
///
/// Every stored sequence is sorted by `(created_at, id)` and holds no
/// duplicate id. Merges are set unions, so pages and live events can land in
/// any order and produce the same result.
#[derive(Debug, Default)]
pub struct MessageTimeline {
    conversations: HashMap<String, ConversationTimeline>,
}

impl MessageTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, conversation_id: &str) -> LoadState {
        self.conversations
            .get(conversation_id)
            .map(|c| c.state)
            .unwrap_or_default()
    }

    pub fn messages(&self, conversation_id: &str) -> Arc<Vec<Message>> {
        self.conversations
            .get(conversation_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    pub fn cursor(&self, conversation_id: &str) -> PaginationCursor {
        self.conversations
            .get(conversation_id)
            .map(|c| c.cursor)
            .unwrap_or_default()
    }

    pub fn find_message(&self, conversation_id: &str, message_id: &str) -> Option<&Message> {
        self.conversations
            .get(conversation_id)?
            .messages
            .iter()
            .find(|m| m.id == message_id)
    }

    /// Mark a conversation as loading. Returns the state to restore on failure.
    pub fn begin_load(&mut self, conversation_id: &str) -> LoadState {
        let entry = self.entry(conversation_id);
        let previous = entry.state;
        if previous == LoadState::Unloaded {
            entry.state = LoadState::Loading;
        }
        previous
    }

    /// Undo `begin_load` after a failed fetch, leaving messages untouched.
    pub fn abort_load(&mut self, conversation_id: &str, previous: LoadState) {
        if let Some(conv) = self.conversations.get_mut(conversation_id) {
            if conv.state == LoadState::Loading {
                conv.state = previous;
            }
        }
    }

    /// Merge the most recent page and reset the cursor from it.
    pub fn apply_initial_page(&mut self, conversation_id: &str, page: Vec<Message>) -> bool {
        let has_more = !page.is_empty();
        let changed = self.merge(conversation_id, page);
        let conv = self.entry(conversation_id);
        conv.state = LoadState::Loaded;
        conv.cursor = PaginationCursor {
            earliest_loaded_created_at: conv.messages.first().map(|m| m.created_at),
            has_more,
        };
        changed
    }

    /// The `before` timestamp for the next older page, or `None` when paging
    /// is exhausted or has not started.
    pub fn older_page_anchor(&self, conversation_id: &str) -> Option<DateTime<Utc>> {
        let cursor = self.cursor(conversation_id);
        if !cursor.has_more {
            return None;
        }
        cursor.earliest_loaded_created_at
    }

    /// Merge an older page and advance the cursor.
    pub fn apply_older_page(&mut self, conversation_id: &str, page: Vec<Message>) -> bool {
        if page.is_empty() {
            let conv = self.entry(conversation_id);
            conv.cursor.has_more = false;
            return false;
        }

        let changed = self.merge(conversation_id, page);
        let conv = self.entry(conversation_id);
        conv.cursor.earliest_loaded_created_at = conv.messages.first().map(|m| m.created_at);
        changed
    }

    /// Insert a live message unless its id is already stored.
    pub fn append_live(&mut self, message: Message) -> bool {
        let conversation_id = message.conversation_id.clone();
        self.merge(&conversation_id, vec![message])
    }

    /// Replace a message's server attachments with the canonical list.
    /// Local placeholders still uploading or failed are kept after them.
    pub fn apply_attachment_update(
        &mut self,
        conversation_id: &str,
        message_id: &str,
        attachments: Vec<Attachment>,
    ) -> bool {
        self.update_message(conversation_id, message_id, |msg| {
            let mut next = attachments;
            next.extend(msg.attachments.iter().filter(|a| a.id.is_local()).cloned());
            if msg.attachments == next {
                return false;
            }
            msg.attachments = next;
            true
        })
    }

    /// Attach upload placeholders to `message`, inserting it first if the
    /// `message.new` echo has not arrived yet.
    pub fn attach_placeholders(&mut self, message: &Message, placeholders: Vec<Attachment>) {
        let conversation_id = message.conversation_id.clone();
        if self.find_message(&conversation_id, &message.id).is_none() {
            self.append_live(message.clone());
        }
        self.update_message(&conversation_id, &message.id, |msg| {
            msg.attachments.extend(placeholders);
            true
        });
    }

    /// Apply a progress value to a placeholder. Values never move backwards.
    pub fn update_placeholder_progress(
        &mut self,
        conversation_id: &str,
        message_id: &str,
        local_id: LocalId,
        progress: u8,
    ) -> bool {
        let progress = progress.min(100);
        self.update_placeholder(conversation_id, message_id, local_id, |att| {
            if !att.uploading || att.progress.unwrap_or(0) >= progress {
                return false;
            }
            att.progress = Some(progress);
            true
        })
    }

    /// Swap a placeholder for the stored object the upload returned. If the
    /// server already listed that object, the placeholder is just dropped.
    pub fn finalize_placeholder(
        &mut self,
        conversation_id: &str,
        message_id: &str,
        local_id: LocalId,
        stored: StoredObject,
    ) -> bool {
        let target = AttachmentId::Local(local_id);
        let server_id = AttachmentId::Server(stored.id.clone());
        self.update_message(conversation_id, message_id, |msg| {
            let Some(idx) = msg.attachments.iter().position(|a| a.id == target) else {
                return false;
            };
            if msg.attachments.iter().any(|a| a.id == server_id) {
                msg.attachments.remove(idx);
            } else {
                msg.attachments[idx] = Attachment::from(stored);
            }
            true
        })
    }

    /// Leave a placeholder in its failed state so the caller can retry or remove it.
    pub fn fail_placeholder(
        &mut self,
        conversation_id: &str,
        message_id: &str,
        local_id: LocalId,
        reason: &str,
    ) -> bool {
        self.update_placeholder(conversation_id, message_id, local_id, |att| {
            att.uploading = false;
            att.object_key = None;
            att.error = Some(reason.to_string());
            true
        })
    }

    /// Drop everything (scope switch).
    pub fn clear(&mut self) {
        self.conversations.clear();
    }

    fn entry(&mut self, conversation_id: &str) -> &mut ConversationTimeline {
        self.conversations
            .entry(conversation_id.to_string())
            .or_default()
    }

    fn merge(&mut self, conversation_id: &str, incoming: Vec<Message>) -> bool {
        let conv = self.entry(conversation_id);
        match merge_messages(&conv.messages, incoming) {
            Some(merged) => {
                conv.messages = Arc::new(merged);
                true
            }
            None => false,
        }
    }

    fn update_message<F>(&mut self, conversation_id: &str, message_id: &str, apply: F) -> bool
    where
        F: FnOnce(&mut Message) -> bool,
    {
        let Some(conv) = self.conversations.get_mut(conversation_id) else {
            return false;
        };
        let Some(idx) = conv.messages.iter().position(|m| m.id == message_id) else {
            log::debug!(
                "Message {} not in timeline {}, update skipped",
                message_id,
                conversation_id
            );
            return false;
        };

        let mut updated = conv.messages[idx].clone();
        if !apply(&mut updated) {
            return false;
        }
        Arc::make_mut(&mut conv.messages)[idx] = updated;
        true
    }

    fn update_placeholder<F>(
        &mut self,
        conversation_id: &str,
        message_id: &str,
        local_id: LocalId,
        apply: F,
    ) -> bool
    where
        F: FnOnce(&mut Attachment) -> bool,
    {
        let target = AttachmentId::Local(local_id);
        self.update_message(conversation_id, message_id, |msg| {
            match msg.attachments.iter_mut().find(|a| a.id == target) {
                Some(att) => apply(att),
                None => false,
            }
        })
    }
}

/// De-duplicated, sorted union of `existing` and `incoming`.
///
/// Returns `None` when `incoming` adds nothing. Stored copies win over
/// incoming duplicates.
pub fn merge_messages(existing: &[Message], incoming: Vec<Message>) -> Option<Vec<Message>> {
    let mut fresh: Vec<Message> = Vec::new();
    for msg in incoming {
        let known = existing.iter().any(|m| m.id == msg.id) || fresh.iter().any(|m| m.id == msg.id);
        if !known {
            fresh.push(msg);
        }
    }
    if fresh.is_empty() {
        return None;
    }

    let mut merged = Vec::with_capacity(existing.len() + fresh.len());
    merged.extend_from_slice(existing);
    merged.extend(fresh);
    merged.sort_by(|a, b| a.timeline_order(b));
    Some(merged)
}
