use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::chat_types::Participant;

/// Per-conversation membership snapshots, populated lazily.
///
/// `last_read_at` never moves backwards: a refetched listing or a read mark
/// older than what is cached is ignored for that participant.
#[derive(Debug, Default)]
pub struct ParticipantCache {
    by_conversation: HashMap<String, Vec<Participant>>,
}

impl ParticipantCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, conversation_id: &str) -> Option<&[Participant]> {
        self.by_conversation
            .get(conversation_id)
            .map(|p| p.as_slice())
    }

    /// Store a freshly fetched membership listing.
    pub fn replace(&mut self, conversation_id: &str, mut listing: Vec<Participant>) {
        if let Some(cached) = self.by_conversation.get(conversation_id) {
            for participant in listing.iter_mut() {
                let known = cached
                    .iter()
                    .find(|c| c.user_id == participant.user_id)
                    .and_then(|c| c.last_read_at);
                participant.last_read_at = latest(participant.last_read_at, known);
            }
        }
        self.by_conversation
            .insert(conversation_id.to_string(), listing);
    }

    /// Apply a read mark. Returns true when the cached state changed.
    pub fn apply_read_mark(
        &mut self,
        conversation_id: &str,
        user_id: &str,
        read_at: DateTime<Utc>,
    ) -> bool {
        let Some(participants) = self.by_conversation.get_mut(conversation_id) else {
            // Not loaded yet; the next listing fetch carries the mark.
            return false;
        };
        let Some(participant) = participants.iter_mut().find(|p| p.user_id == user_id) else {
            log::debug!(
                "Read mark for unknown participant {} in {}",
                user_id,
                conversation_id
            );
            return false;
        };

        let next = latest(participant.last_read_at, Some(read_at));
        if next == participant.last_read_at {
            return false;
        }
        participant.last_read_at = next;
        true
    }

    /// The participant other than `my_id`, if any.
    pub fn counterpart(&self, conversation_id: &str, my_id: &str) -> Option<&Participant> {
        self.get(conversation_id)?
            .iter()
            .find(|p| p.user_id != my_id)
    }

    pub fn clear(&mut self) {
        self.by_conversation.clear();
    }
}

fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}
