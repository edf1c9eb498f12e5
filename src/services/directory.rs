use std::collections::HashMap;

use super::chat_types::{Conversation, ConversationKind, Message, MessagePreview};

const DIRECT_FALLBACK_NAME: &str = "Direct message";

/// Conversations of the active scope, with derived display names and
/// last-message previews.
#[derive(Debug, Default)]
pub struct ConversationDirectory {
    scope: Option<String>,
    conversations: Vec<Conversation>,
    /// Counterpart names for `Direct` conversations, keyed by conversation id.
    direct_names: HashMap<String, String>,
    previews: HashMap<String, MessagePreview>,
}

impl ConversationDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// True when `scope` differs from the scope the directory holds data for.
    pub fn is_scope_change(&self, scope: &str) -> bool {
        self.scope.as_deref() != Some(scope)
    }

    /// Forget everything and start over for `scope`.
    pub fn reset_scope(&mut self, scope: &str) {
        log::info!(
            "Switching conversation scope from {:?} to {}",
            self.scope,
            scope
        );
        self.scope = Some(scope.to_string());
        self.conversations.clear();
        self.direct_names.clear();
        self.previews.clear();
    }

    /// Install a fetched listing. Duplicate ids keep their first occurrence.
    pub fn replace_conversations(&mut self, listing: Vec<Conversation>) {
        let mut unique: Vec<Conversation> = Vec::with_capacity(listing.len());
        for conv in listing {
            if unique.iter().any(|c| c.id == conv.id) {
                log::warn!("Duplicate conversation {} in listing, keeping first", conv.id);
                continue;
            }
            unique.push(conv);
        }
        self.conversations = unique;
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, conversation_id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == conversation_id)
    }

    pub fn direct_conversation_ids(&self) -> Vec<String> {
        self.conversations
            .iter()
            .filter(|c| c.kind == ConversationKind::Direct)
            .map(|c| c.id.clone())
            .collect()
    }

    pub fn set_direct_name(&mut self, conversation_id: &str, name: String) {
        self.direct_names.insert(conversation_id.to_string(), name);
    }

    pub fn display_name(&self, conversation_id: &str) -> Option<String> {
        let conv = self.get(conversation_id)?;
        if let Some(title) = conv.title.as_deref().filter(|t| !t.is_empty()) {
            return Some(title.to_string());
        }
        Some(match conv.kind {
            ConversationKind::Direct => self
                .direct_names
                .get(conversation_id)
                .cloned()
                .unwrap_or_else(|| DIRECT_FALLBACK_NAME.to_string()),
            kind => format!("{:?}", kind),
        })
    }

    pub fn preview(&self, conversation_id: &str) -> Option<&MessagePreview> {
        self.previews.get(conversation_id)
    }

    /// Record a preview; the newest timestamp wins, later arrival wins ties.
    pub fn record_preview(&mut self, conversation_id: &str, preview: MessagePreview) -> bool {
        match self.previews.get(conversation_id) {
            Some(current) if current.created_at > preview.created_at => false,
            Some(current) if *current == preview => false,
            _ => {
                self.previews.insert(conversation_id.to_string(), preview);
                true
            }
        }
    }

    pub fn record_message_preview(&mut self, message: &Message) -> bool {
        self.record_preview(
            &message.conversation_id,
            MessagePreview {
                content: message.preview_text(),
                created_at: message.created_at,
            },
        )
    }
}
