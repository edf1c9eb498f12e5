// Command layer wired to real HTTP clients against a mock server

use convo_sync::chat_types::{ConnectionState, ConversationKind, LoadState};
use convo_sync::commands;
use convo_sync::services::transport::StaticIdentity;
use convo_sync::services::{ConfigService, ScrollCommand};
use convo_sync::AppState;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn app(server: &MockServer, dir: &TempDir) -> AppState {
    let mut config = ConfigService::with_path(dir.path().join("config.toml")).unwrap();
    let mut settings = config.get();
    settings.server.api_base_url = server.uri();
    // Nothing listens here; the live channel ends up in the error state.
    settings.server.ws_url = "ws://127.0.0.1:1/live".to_string();
    settings.server.request_timeout_secs = 2;
    settings.viewport.persist_scroll = false;
    config.update(settings).unwrap();

    let identity = StaticIdentity {
        user_id: "me".to_string(),
        credential: "secret".to_string(),
    };
    AppState::with_config(config, identity, None).unwrap()
}

async fn mount_scope(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/scopes/e1/conversations"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {"id": "c1", "kind": "GROUP", "title": "Crew", "updatedAt": "2024-03-01T10:00:00Z"},
            {"id": "d1", "kind": "DIRECT", "updatedAt": "2024-03-01T09:00:00Z"}
        ])))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/conversations/d1/participants"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {"userId": "me", "displayName": "Me"},
            {"userId": "u1", "displayName": "Ada", "lastReadAt": "2024-03-01T10:01:00Z"}
        ])))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/conversations/c1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [
                {"id": "m1", "conversationId": "c1", "authorId": "u1", "body": "first",
                 "createdAt": "2024-03-01T10:00:00Z"},
                {"id": "m2", "conversationId": "c1", "authorId": "me", "body": "second",
                 "createdAt": "2024-03-01T10:02:00Z"}
            ]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/conversations/d1/messages"))
        .respond_with(ResponseTemplate::new(500))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_open_scope_lists_conversations_while_offline() {
    let server = MockServer::start().await;
    mount_scope(&server).await;
    let dir = TempDir::new().unwrap();
    let state = app(&server, &dir).await;

    let rows = commands::open_scope(&state, "e1".to_string()).await.unwrap();
    assert_eq!(rows.len(), 2);

    let crew = rows.iter().find(|r| r.id == "c1").unwrap();
    assert_eq!(crew.display_name, "Crew");
    assert_eq!(crew.preview.as_ref().unwrap().content, "second");

    let direct = rows.iter().find(|r| r.id == "d1").unwrap();
    assert_eq!(direct.kind, ConversationKind::Direct);
    assert_eq!(direct.display_name, "Ada");
    // Preview fetch failed; the row is still listed.
    assert!(direct.preview.is_none());

    assert!(matches!(
        commands::get_connection_state(&state).await,
        ConnectionState::Error(_)
    ));
}

#[tokio::test]
async fn test_open_conversation_pins_to_bottom_on_first_visit() {
    let server = MockServer::start().await;
    mount_scope(&server).await;
    let dir = TempDir::new().unwrap();
    let state = app(&server, &dir).await;
    commands::open_scope(&state, "e1".to_string()).await.unwrap();

    let view = commands::open_conversation(&state, "c1".to_string(), None)
        .await
        .unwrap();
    assert_eq!(view.messages.len(), 2);
    assert_eq!(view.load_state, LoadState::Loaded);
    assert_eq!(view.scroll, ScrollCommand::PinToBottom);

    commands::record_scroll_position(&state, "c1".to_string(), 140.0).await;
    commands::open_conversation(&state, "d1".to_string(), Some(140.0))
        .await
        .unwrap();
    let back = commands::open_conversation(&state, "c1".to_string(), None)
        .await
        .unwrap();
    assert_eq!(back.scroll, ScrollCommand::ScrollTo(140.0));
}

#[tokio::test]
async fn test_failed_page_fetch_is_swallowed() {
    let server = MockServer::start().await;
    mount_scope(&server).await;
    let dir = TempDir::new().unwrap();
    let state = app(&server, &dir).await;
    commands::open_scope(&state, "e1".to_string()).await.unwrap();

    let view = commands::open_conversation(&state, "d1".to_string(), None)
        .await
        .unwrap();
    assert!(view.messages.is_empty());
    assert_eq!(view.load_state, LoadState::Unloaded);
    // Nothing rendered, so the list is not pinned.
    assert_eq!(view.scroll, ScrollCommand::Stay);
}

#[tokio::test]
async fn test_send_error_propagates_to_caller() {
    let server = MockServer::start().await;
    mount_scope(&server).await;
    Mock::given(method("POST"))
        .and(path("/conversations/c1/messages"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();
    let state = app(&server, &dir).await;
    commands::open_scope(&state, "e1".to_string()).await.unwrap();

    let result = commands::send_chat_message(&state, "c1".to_string(), "hello".to_string()).await;
    assert!(result.is_err());
}
