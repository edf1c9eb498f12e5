//! Core sync orchestrator: ties together the live channel, directory,
//! participants, timeline and uploads.
//!
//! Network calls never run under a component lock. Results are merged when
//! they arrive, keyed by conversation id, and dropped if the scope changed in
//! the meantime.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use super::chat_types::*;
use super::config::ChatSettings;
use super::connection::{ConnectionHandle, ConnectionManager};
use super::directory::ConversationDirectory;
use super::participants::ParticipantCache;
use super::read_receipts;
use super::timeline::MessageTimeline;
use super::transport::{AttachmentStore, ChatApi, ContextResolver, IdentityProvider, LiveConnector};
use super::uploads::{UploadPipeline, UploadReport};
use crate::error::{Result, SyncError};

const UI_EVENT_BUFFER: usize = 512;

/// External collaborators the engine depends on.
pub struct ChatDeps {
    pub api: Arc<dyn ChatApi>,
    pub connector: Arc<dyn LiveConnector>,
    pub attachments: Arc<dyn AttachmentStore>,
    pub identity: Arc<dyn IdentityProvider>,
    pub context: Arc<dyn ContextResolver>,
}

/// Core chat sync service.
pub struct ChatService {
    api: Arc<dyn ChatApi>,
    identity: Arc<dyn IdentityProvider>,
    context: Arc<dyn ContextResolver>,
    connection: Arc<ConnectionManager>,
    directory: Arc<RwLock<ConversationDirectory>>,
    participants: Arc<RwLock<ParticipantCache>>,
    timeline: Arc<RwLock<MessageTimeline>>,
    uploads: UploadPipeline,
    events: broadcast::Sender<ChatEvent>,
    settings: ChatSettings,
    /// Bumped on every scope switch; stale results compare against it.
    scope_generation: AtomicU64,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ChatService {
    pub fn new(deps: ChatDeps, settings: ChatSettings) -> Self {
        let (events, _) = broadcast::channel(UI_EVENT_BUFFER);
        let connection = Arc::new(ConnectionManager::new(deps.connector));
        let timeline = Arc::new(RwLock::new(MessageTimeline::new()));
        let uploads = UploadPipeline::new(
            deps.attachments,
            timeline.clone(),
            connection.clone(),
            events.clone(),
        );

        Self {
            api: deps.api,
            identity: deps.identity,
            context: deps.context,
            connection,
            directory: Arc::new(RwLock::new(ConversationDirectory::new())),
            participants: Arc::new(RwLock::new(ParticipantCache::new())),
            timeline,
            uploads,
            events,
            settings,
            scope_generation: AtomicU64::new(0),
            dispatcher: std::sync::Mutex::new(None),
        }
    }

    /// UI change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    pub fn current_user_id(&self) -> Option<String> {
        self.identity.current_user_id()
    }

    fn notify(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }

    fn current_generation(&self) -> u64 {
        self.scope_generation.load(Ordering::SeqCst)
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.current_generation() != generation
    }

    // ── Live channel ───────────────────────────────────────────

    /// Subscribe to the live channel and dispatch its events. Must run
    /// before any conversation is joined; calling it again is a no-op.
    pub fn start_live_dispatch(self: &Arc<Self>) {
        let Ok(mut dispatcher) = self.dispatcher.lock() else {
            return;
        };
        if dispatcher.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let mut live_rx = self.connection.subscribe();
        let mut state_rx = self.connection.watch_state();
        let engine: Weak<Self> = Arc::downgrade(self);

        *dispatcher = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = live_rx.recv() => match received {
                        Ok(event) => {
                            let Some(engine) = engine.upgrade() else { break };
                            engine.handle_live_event(event).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Live dispatch lagged {} events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = state_rx.borrow_and_update().clone();
                        let Some(engine) = engine.upgrade() else { break };
                        engine.notify(ChatEvent::ConnectionChanged { state });
                    }
                }
            }
            log::debug!("Live dispatch stopped");
        }));
    }

    /// Connect for the current credential and scope, then join every known
    /// conversation. Errors show up in [`ChatService::connection_state`].
    pub async fn connect(&self) -> Option<ConnectionHandle> {
        let (Some(credential), Some(scope)) =
            (self.identity.credential(), self.context.active_scope())
        else {
            log::warn!("Cannot connect live channel without credential and scope");
            return None;
        };

        let handle = self.connection.connect(&credential, &scope).await?;
        let ids: Vec<String> = {
            let dir = self.directory.read().await;
            if dir.scope() == Some(scope.as_str()) {
                dir.conversations().iter().map(|c| c.id.clone()).collect()
            } else {
                Vec::new()
            }
        };
        Self::join_all(&handle, &ids).await;
        Some(handle)
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    async fn join_all(handle: &ConnectionHandle, conversation_ids: &[String]) {
        for id in conversation_ids {
            if let Err(e) = handle.channel().join(id).await {
                log::warn!("Failed to join conversation {}: {}", id, e);
            }
        }
    }

    /// Single entry point for inbound live events.
    pub async fn handle_live_event(&self, event: LiveEvent) {
        match event {
            LiveEvent::MessageNew(message) => {
                self.append_live(message).await;
            }
            LiveEvent::AttachmentUpdate(update) => {
                self.apply_attachment_update(
                    &update.conversation_id,
                    &update.message_id,
                    update.attachments,
                )
                .await;
            }
            LiveEvent::ReadMarked(mark) => {
                let changed = self.participants.write().await.apply_read_mark(
                    &mark.conversation_id,
                    &mark.user_id,
                    mark.read_at,
                );
                if changed {
                    self.notify(ChatEvent::ParticipantsChanged {
                        conversation_id: mark.conversation_id,
                    });
                }
            }
            LiveEvent::ConnectError(reason) => {
                log::warn!("Live channel error: {}", reason);
            }
        }
    }

    // ── Conversation directory ─────────────────────────────────

    /// Load the conversation list for `scope`. Switching scope drops every
    /// per-conversation cache first.
    pub async fn load_conversations(&self, scope: &str) -> Result<Vec<Conversation>> {
        if self.directory.read().await.is_scope_change(scope) {
            self.invalidate_scope(scope).await;
        }
        let generation = self.current_generation();

        let listing = self.api.list_conversations(scope).await?;
        if self.is_stale(generation) {
            return Err(SyncError::Fetch(format!(
                "Scope changed while loading conversations for {}",
                scope
            )));
        }

        let conversations = {
            let mut dir = self.directory.write().await;
            dir.replace_conversations(listing);
            dir.conversations().to_vec()
        };
        log::info!("Loaded {} conversations for scope {}", conversations.len(), scope);
        self.notify(ChatEvent::DirectoryChanged);

        if let Some(handle) = self.connection.current().await {
            if handle.key().scope == scope {
                let ids: Vec<String> = conversations.iter().map(|c| c.id.clone()).collect();
                Self::join_all(&handle, &ids).await;
            }
        }

        let direct_ids: Vec<String> = conversations
            .iter()
            .filter(|c| c.kind == ConversationKind::Direct)
            .map(|c| c.id.clone())
            .collect();
        let all_ids: Vec<String> = conversations.iter().map(|c| c.id.clone()).collect();
        futures::join!(
            self.resolve_direct_names(&direct_ids, generation),
            self.refresh_previews(&all_ids, generation)
        );

        Ok(conversations)
    }

    async fn invalidate_scope(&self, scope: &str) {
        self.scope_generation.fetch_add(1, Ordering::SeqCst);
        self.directory.write().await.reset_scope(scope);
        self.timeline.write().await.clear();
        self.participants.write().await.clear();
        self.notify(ChatEvent::DirectoryChanged);
    }

    /// Resolve counterpart names of direct conversations, each independently.
    async fn resolve_direct_names(&self, conversation_ids: &[String], generation: u64) {
        let Some(my_id) = self.identity.current_user_id() else {
            return;
        };

        let lookups = conversation_ids.iter().map(|id| {
            let my_id = my_id.clone();
            async move {
                match self.participants(id).await {
                    Ok(members) => members
                        .into_iter()
                        .find(|p| p.user_id != my_id)
                        .map(|p| (id.clone(), p.display_name)),
                    Err(e) => {
                        log::warn!("Could not resolve name for conversation {}: {}", id, e);
                        None
                    }
                }
            }
        });
        let resolved = futures::future::join_all(lookups).await;

        if self.is_stale(generation) {
            return;
        }
        let mut changed = false;
        let mut dir = self.directory.write().await;
        for (id, name) in resolved.into_iter().flatten() {
            dir.set_direct_name(&id, name);
            changed = true;
        }
        drop(dir);
        if changed {
            self.notify(ChatEvent::DirectoryChanged);
        }
    }

    /// Best-effort last-message previews, one single-item page per conversation.
    async fn refresh_previews(&self, conversation_ids: &[String], generation: u64) {
        let fetches = conversation_ids.iter().map(|id| async move {
            match self
                .api
                .list_messages(id, self.settings.preview_page_size, None)
                .await
            {
                Ok(page) => page.items.into_iter().max_by(|a, b| a.timeline_order(b)),
                Err(e) => {
                    log::debug!("Preview fetch for {} failed: {}", id, e);
                    None
                }
            }
        });

        for latest in futures::future::join_all(fetches).await.into_iter().flatten() {
            if self.is_stale(generation) {
                return;
            }
            if self.directory.write().await.record_message_preview(&latest) {
                self.notify(ChatEvent::DirectoryChanged);
            }
        }
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.directory.read().await.conversations().to_vec()
    }

    pub async fn display_name(&self, conversation_id: &str) -> Option<String> {
        self.directory.read().await.display_name(conversation_id)
    }

    pub async fn preview(&self, conversation_id: &str) -> Option<MessagePreview> {
        self.directory.read().await.preview(conversation_id).cloned()
    }

    // ── Participants ───────────────────────────────────────────

    /// Cached membership, fetched on first use.
    pub async fn participants(&self, conversation_id: &str) -> Result<Vec<Participant>> {
        if let Some(cached) = self.participants.read().await.get(conversation_id) {
            return Ok(cached.to_vec());
        }
        self.refresh_participants(conversation_id).await
    }

    pub async fn refresh_participants(&self, conversation_id: &str) -> Result<Vec<Participant>> {
        let generation = self.current_generation();
        let listing = self.api.list_participants(conversation_id).await?;
        if self.is_stale(generation) {
            return Ok(listing);
        }

        let snapshot = {
            let mut cache = self.participants.write().await;
            cache.replace(conversation_id, listing);
            cache.get(conversation_id).map(|p| p.to_vec()).unwrap_or_default()
        };
        self.notify(ChatEvent::ParticipantsChanged {
            conversation_id: conversation_id.to_string(),
        });
        Ok(snapshot)
    }

    // ── Timeline ───────────────────────────────────────────────

    /// Fetch the most recent page of a conversation.
    pub async fn load_initial(
        &self,
        conversation_id: &str,
        page_size: usize,
    ) -> Result<Arc<Vec<Message>>> {
        let generation = self.current_generation();
        let previous = self.timeline.write().await.begin_load(conversation_id);

        let page = match self.api.list_messages(conversation_id, page_size, None).await {
            Ok(page) => page,
            Err(e) => {
                self.timeline
                    .write()
                    .await
                    .abort_load(conversation_id, previous);
                return Err(e);
            }
        };
        if self.is_stale(generation) {
            return Ok(Arc::default());
        }

        let latest = page.items.iter().max_by(|a, b| a.timeline_order(b)).cloned();
        let messages = {
            let mut timeline = self.timeline.write().await;
            timeline.apply_initial_page(conversation_id, page.items);
            timeline.messages(conversation_id)
        };
        if let Some(latest) = latest {
            if self.directory.write().await.record_message_preview(&latest) {
                self.notify(ChatEvent::DirectoryChanged);
            }
        }
        self.notify(ChatEvent::TimelineChanged {
            conversation_id: conversation_id.to_string(),
        });
        Ok(messages)
    }

    /// Fetch the page before the cursor. Without a cursor, or once history
    /// is exhausted, nothing is fetched and the current array is returned.
    pub async fn load_older(&self, conversation_id: &str) -> Result<Arc<Vec<Message>>> {
        let before = {
            let timeline = self.timeline.read().await;
            match timeline.older_page_anchor(conversation_id) {
                Some(before) => before,
                None => return Ok(timeline.messages(conversation_id)),
            }
        };
        let generation = self.current_generation();

        let page = self
            .api
            .list_messages(conversation_id, self.settings.page_size, Some(before))
            .await?;
        if self.is_stale(generation) {
            return Ok(Arc::default());
        }

        let (changed, messages) = {
            let mut timeline = self.timeline.write().await;
            let changed = timeline.apply_older_page(conversation_id, page.items);
            (changed, timeline.messages(conversation_id))
        };
        if changed {
            self.notify(ChatEvent::TimelineChanged {
                conversation_id: conversation_id.to_string(),
            });
        }
        Ok(messages)
    }

    /// Insert a message pushed by the server (or acknowledged to us).
    pub async fn append_live(&self, message: Message) -> bool {
        let conversation_id = message.conversation_id.clone();
        let preview_changed = self
            .directory
            .write()
            .await
            .record_message_preview(&message);
        let inserted = self.timeline.write().await.append_live(message);

        if preview_changed {
            self.notify(ChatEvent::DirectoryChanged);
        }
        if inserted {
            self.notify(ChatEvent::TimelineChanged { conversation_id });
        }
        inserted
    }

    /// Replace a message's attachments with the server's canonical list.
    pub async fn apply_attachment_update(
        &self,
        conversation_id: &str,
        message_id: &str,
        attachments: Vec<Attachment>,
    ) -> bool {
        let changed = self.timeline.write().await.apply_attachment_update(
            conversation_id,
            message_id,
            attachments,
        );
        if changed {
            self.notify(ChatEvent::TimelineChanged {
                conversation_id: conversation_id.to_string(),
            });
        }
        changed
    }

    pub async fn messages(&self, conversation_id: &str) -> Arc<Vec<Message>> {
        self.timeline.read().await.messages(conversation_id)
    }

    pub async fn cursor(&self, conversation_id: &str) -> PaginationCursor {
        self.timeline.read().await.cursor(conversation_id)
    }

    pub async fn load_state(&self, conversation_id: &str) -> LoadState {
        self.timeline.read().await.state(conversation_id)
    }

    // ── Sending ────────────────────────────────────────────────

    /// Send a text message. Uses the live channel when connected and falls
    /// back to the REST endpoint otherwise. The message appears in the
    /// timeline once the server has acknowledged it.
    pub async fn send_message(&self, conversation_id: &str, body: &str) -> Result<Message> {
        if body.len() > self.settings.max_message_size {
            return Err(SyncError::Send(format!(
                "Message too large: {} bytes (max {})",
                body.len(),
                self.settings.max_message_size
            )));
        }

        if let Some(handle) = self.connection.current().await {
            match handle.channel().send_message(conversation_id, body).await {
                Ok(acked) => {
                    self.append_live(acked.clone()).await;
                    return Ok(acked);
                }
                Err(e) => log::warn!(
                    "Live send to {} failed, falling back to REST: {}",
                    conversation_id,
                    e
                ),
            }
        }

        let created = self
            .api
            .create_message(conversation_id, body)
            .await
            .map_err(|e| match e {
                SyncError::Send(_) => e,
                other => SyncError::Send(other.to_string()),
            })?;
        self.append_live(created.clone()).await;
        Ok(created)
    }

    /// Send files as a new message: create the message with `placeholder_body`,
    /// then upload each file onto it in order.
    pub async fn send_files(
        &self,
        conversation_id: &str,
        placeholder_body: &str,
        files: Vec<UploadFile>,
    ) -> Result<UploadReport> {
        let scope = {
            let dir = self.directory.read().await;
            dir.scope().map(String::from)
        }
        .or_else(|| self.context.active_scope())
        .ok_or_else(|| SyncError::Config("No active conversation scope".to_string()))?;

        let message = self.send_message(conversation_id, placeholder_body).await?;
        Ok(self.uploads.run(&scope, &message, files).await)
    }

    pub async fn cancel_upload(&self, message_id: &str) -> Result<()> {
        self.uploads.cancel(message_id).await
    }

    // ── Read receipts ──────────────────────────────────────────

    /// Tell the server we have read a conversation and advance our own mark.
    pub async fn mark_read(&self, conversation_id: &str) -> Result<()> {
        let mut sent = false;
        if let Some(handle) = self.connection.current().await {
            match handle.channel().mark_read(conversation_id).await {
                Ok(()) => sent = true,
                Err(e) => log::warn!("Live mark-read failed for {}: {}", conversation_id, e),
            }
        }
        if !sent {
            self.api.mark_read(conversation_id).await?;
        }

        if let Some(my_id) = self.identity.current_user_id() {
            let changed = self.participants.write().await.apply_read_mark(
                conversation_id,
                &my_id,
                Utc::now(),
            );
            if changed {
                self.notify(ChatEvent::ParticipantsChanged {
                    conversation_id: conversation_id.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Whether a message counts as read by the other side.
    pub async fn read_state(&self, conversation_id: &str, message_id: &str) -> bool {
        let (kind, conversation_flag) = {
            let dir = self.directory.read().await;
            match dir.get(conversation_id) {
                Some(conv) => (conv.kind, conv.all_read),
                None => return false,
            }
        };
        let (message_at, message_flag) = {
            let timeline = self.timeline.read().await;
            match timeline.find_message(conversation_id, message_id) {
                Some(msg) => (Some(msg.created_at), msg.all_read),
                None => (None, None),
            }
        };
        let my_id = self.identity.current_user_id();
        let participants = self.participants.read().await;

        read_receipts::message_read_state(
            kind,
            participants.get(conversation_id),
            my_id.as_deref(),
            message_at,
            message_flag.or(conversation_flag),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::transport::{
        MockAttachmentStore, MockChatApi, StaticContext, StaticIdentity,
    };
    use chrono::{DateTime, TimeZone};
    use mockall::predicate::eq;
    use tokio::sync::mpsc;

    struct OfflineConnector;

    #[async_trait::async_trait]
    impl LiveConnector for OfflineConnector {
        async fn open(
            &self,
            _credential: &str,
            _scope: &str,
            _events: mpsc::UnboundedSender<LiveEvent>,
        ) -> Result<Arc<dyn crate::services::transport::LiveChannel>> {
            Err(SyncError::Transport("offline".to_string()))
        }
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, minute, 0).unwrap()
    }

    fn msg(id: &str, minute: u32) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            author_id: "u1".to_string(),
            body: Some(id.to_string()),
            parent_id: None,
            created_at: at(minute),
            attachments: Vec::new(),
            all_read: None,
        }
    }

    fn service(api: MockChatApi) -> ChatService {
        ChatService::new(
            ChatDeps {
                api: Arc::new(api),
                connector: Arc::new(OfflineConnector),
                attachments: Arc::new(MockAttachmentStore::new()),
                identity: Arc::new(StaticIdentity {
                    user_id: "me".to_string(),
                    credential: "token".to_string(),
                }),
                context: Arc::new(StaticContext::new(Some("e1".to_string()))),
            },
            ChatSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_load_older_after_exhaustion_makes_no_call() {
        let mut api = MockChatApi::new();
        api.expect_list_messages()
            .with(eq("c1"), eq(30), eq(None))
            .times(1)
            .returning(|_, _, _| {
                Ok(MessagePage {
                    items: vec![msg("m2", 2)],
                    next_cursor: None,
                })
            });
        api.expect_list_messages()
            .with(eq("c1"), eq(30), eq(Some(at(2))))
            .times(1)
            .returning(|_, _, _| Ok(MessagePage::default()));

        let svc = service(api);
        svc.load_initial("c1", 30).await.unwrap();
        svc.load_older("c1").await.unwrap();
        assert!(!svc.cursor("c1").await.has_more);

        // Exhausted: the mock would panic on a third call.
        let before = svc.messages("c1").await;
        let after = svc.load_older("c1").await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn test_failed_initial_load_keeps_prior_state() {
        let mut api = MockChatApi::new();
        api.expect_list_messages()
            .returning(|_, _, _| Err(SyncError::Fetch("boom".to_string())));

        let svc = service(api);
        svc.append_live(msg("m1", 1)).await;
        assert!(svc.load_initial("c1", 30).await.is_err());
        assert_eq!(svc.load_state("c1").await, LoadState::Unloaded);
        assert_eq!(svc.messages("c1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_send_falls_back_to_rest_when_offline() {
        let mut api = MockChatApi::new();
        api.expect_create_message()
            .with(eq("c1"), eq("hello"))
            .times(1)
            .returning(|_, _| Ok(msg("m7", 7)));

        let svc = service(api);
        let sent = svc.send_message("c1", "hello").await.unwrap();
        assert_eq!(sent.id, "m7");
        assert_eq!(svc.messages("c1").await.len(), 1);
        assert_eq!(svc.preview("c1").await.unwrap().content, "m7");
    }

    #[tokio::test]
    async fn test_send_failure_surfaces() {
        let mut api = MockChatApi::new();
        api.expect_create_message()
            .returning(|_, _| Err(SyncError::Fetch("503".to_string())));

        let svc = service(api);
        let err = svc.send_message("c1", "hello").await.unwrap_err();
        assert!(matches!(err, SyncError::Send(_)));
        assert!(svc.messages("c1").await.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_message_rejected_before_io() {
        let svc = service(MockChatApi::new());
        let body = "x".repeat(ChatSettings::default().max_message_size + 1);
        assert!(matches!(
            svc.send_message("c1", &body).await,
            Err(SyncError::Send(_))
        ));
    }

    #[tokio::test]
    async fn test_read_marks_flow_into_read_state() {
        let mut api = MockChatApi::new();
        api.expect_list_conversations().returning(|_| {
            Ok(vec![Conversation {
                id: "c1".to_string(),
                kind: ConversationKind::Direct,
                title: None,
                updated_at: at(0),
                all_read: None,
            }])
        });
        api.expect_list_participants().returning(|_| {
            Ok(vec![
                Participant {
                    user_id: "me".to_string(),
                    display_name: "Me".to_string(),
                    avatar_ref: None,
                    last_read_at: None,
                },
                Participant {
                    user_id: "u1".to_string(),
                    display_name: "Ada".to_string(),
                    avatar_ref: None,
                    last_read_at: Some(at(1)),
                },
            ])
        });
        api.expect_list_messages()
            .returning(|_, _, _| Ok(MessagePage::default()));

        let svc = service(api);
        svc.load_conversations("e1").await.unwrap();
        assert_eq!(svc.display_name("c1").await.as_deref(), Some("Ada"));

        svc.append_live(msg("m3", 3)).await;
        assert!(!svc.read_state("c1", "m3").await);

        svc.handle_live_event(LiveEvent::ReadMarked(ReadMark {
            conversation_id: "c1".to_string(),
            user_id: "u1".to_string(),
            read_at: at(3),
        }))
        .await;
        assert!(svc.read_state("c1", "m3").await);
    }
}
