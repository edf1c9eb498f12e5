use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::services::config::scroll_state_path;
use crate::services::transport::{StaticContext, StaticIdentity};
use crate::services::{
    ChatDeps, ChatService, ConfigService, HttpAttachmentStore, RestChatApi, ViewportController,
    WsConnector,
};

/// Shared state handed to every command.
pub struct AppState {
    pub config: Arc<RwLock<ConfigService>>,
    pub chat: Arc<ChatService>,
    pub context: Arc<StaticContext>,
    pub viewport: Arc<RwLock<ViewportController>>,
}

impl AppState {
    /// Build from the persisted configuration.
    pub fn new(identity: StaticIdentity, scope: Option<String>) -> Result<Self> {
        Self::with_config(ConfigService::new(), identity, scope)
    }

    pub fn with_config(
        config_service: ConfigService,
        identity: StaticIdentity,
        scope: Option<String>,
    ) -> Result<Self> {
        let app_config = config_service.get();
        let server = &app_config.server;

        log::info!(
            "Initializing chat sync: api={}, live={}, timeout={}s",
            server.api_base_url,
            server.ws_url,
            server.request_timeout_secs
        );

        let api = RestChatApi::new(
            &server.api_base_url,
            &identity.credential,
            server.request_timeout(),
        )?;
        let attachments = HttpAttachmentStore::new(
            &server.api_base_url,
            &identity.credential,
            server.request_timeout(),
        )?;
        let connector = WsConnector::new(&server.ws_url, server.request_timeout());
        let context = Arc::new(StaticContext::new(scope));

        let chat = ChatService::new(
            ChatDeps {
                api: Arc::new(api),
                connector: Arc::new(connector),
                attachments: Arc::new(attachments),
                identity: Arc::new(identity),
                context: context.clone(),
            },
            app_config.chat.clone(),
        );

        let threshold = app_config.viewport.near_bottom_threshold;
        let viewport = match (app_config.viewport.persist_scroll, scroll_state_path()) {
            (true, Some(path)) => ViewportController::with_storage(threshold, &path),
            _ => ViewportController::new(threshold),
        };

        Ok(Self::from_parts(
            config_service,
            Arc::new(chat),
            context,
            viewport,
        ))
    }

    /// Assemble from already-built parts.
    pub fn from_parts(
        config_service: ConfigService,
        chat: Arc<ChatService>,
        context: Arc<StaticContext>,
        viewport: ViewportController,
    ) -> Self {
        chat.start_live_dispatch();
        Self {
            config: Arc::new(RwLock::new(config_service)),
            chat,
            context,
            viewport: Arc::new(RwLock::new(viewport)),
        }
    }
}
