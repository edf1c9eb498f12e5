//! REST client for bulk fetches.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::chat_types::{Conversation, Message, MessagePage, Participant};
use super::transport::ChatApi;
use crate::error::{Result, SyncError};

pub struct RestChatApi {
    base_url: String,
    credential: String,
    client: reqwest::Client,
}

impl RestChatApi {
    pub fn new(base_url: &str, credential: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            credential: credential.to_string(),
            client,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<url::Url> {
        let path = segments
            .iter()
            .map(|s| urlencoding::encode(s).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        url::Url::parse(&format!("{}/{}", self.base_url, path))
            .map_err(|e| SyncError::Config(format!("Invalid API URL: {}", e)))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: url::Url, what: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.credential)
            .send()
            .await
            .map_err(|e| SyncError::Fetch(format!("{}: {}", what, e)))?;

        if !response.status().is_success() {
            return Err(SyncError::Fetch(format!(
                "{} returned {}",
                what,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| SyncError::Fetch(format!("Failed to parse {}: {}", what, e)))
    }
}

#[async_trait]
impl ChatApi for RestChatApi {
    async fn list_conversations(&self, scope: &str) -> Result<Vec<Conversation>> {
        let url = self.url(&["scopes", scope, "conversations"])?;
        self.get_json(url, "Conversation list").await
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<MessagePage> {
        let mut url = self.url(&["conversations", conversation_id, "messages"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &limit.to_string());
            if let Some(before) = before {
                query.append_pair(
                    "before",
                    &before.to_rfc3339_opts(SecondsFormat::Millis, true),
                );
            }
        }
        self.get_json(url, "Message page").await
    }

    async fn list_participants(&self, conversation_id: &str) -> Result<Vec<Participant>> {
        let url = self.url(&["conversations", conversation_id, "participants"])?;
        self.get_json(url, "Participant list").await
    }

    async fn mark_read(&self, conversation_id: &str) -> Result<()> {
        let url = self.url(&["conversations", conversation_id, "read"])?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.credential)
            .send()
            .await
            .map_err(|e| SyncError::Fetch(format!("Mark read: {}", e)))?;

        if !response.status().is_success() {
            return Err(SyncError::Fetch(format!(
                "Mark read returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn create_message(&self, conversation_id: &str, body: &str) -> Result<Message> {
        let url = self.url(&["conversations", conversation_id, "messages"])?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.credential)
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await
            .map_err(|e| SyncError::Send(format!("Create message: {}", e)))?;

        if !response.status().is_success() {
            return Err(SyncError::Send(format!(
                "Create message returned {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| SyncError::Send(format!("Failed to parse created message: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api(server: &MockServer) -> RestChatApi {
        RestChatApi::new(&server.uri(), "secret", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_list_conversations_sends_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/scopes/e1/conversations"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": "c1", "kind": "GROUP", "title": "Crew", "updatedAt": "2024-03-01T10:00:00Z"}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let convs = api(&server).list_conversations("e1").await.unwrap();
        assert_eq!(convs.len(), 1);
        assert_eq!(convs[0].title.as_deref(), Some("Crew"));
    }

    #[tokio::test]
    async fn test_list_messages_passes_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/conversations/c1/messages"))
            .and(query_param("limit", "20"))
            .and(query_param("before", "2024-03-01T10:05:00.000Z"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"id": "m1", "conversationId": "c1", "authorId": "u1",
                           "createdAt": "2024-03-01T10:00:00Z"}],
                "nextCursor": "abc"
            })))
            .mount(&server)
            .await;

        let before = Utc.with_ymd_and_hms(2024, 3, 1, 10, 5, 0).unwrap();
        let page = api(&server)
            .list_messages("c1", 20, Some(before))
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_server_error_is_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/conversations/c1/participants"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = api(&server).list_participants("c1").await.unwrap_err();
        assert!(matches!(err, SyncError::Fetch(_)));
    }

    #[tokio::test]
    async fn test_create_message_posts_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/conversations/c1/messages"))
            .and(body_json(serde_json::json!({"body": "hello"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "id": "m9", "conversationId": "c1", "authorId": "me",
                "body": "hello", "createdAt": "2024-03-01T10:00:00Z"
            })))
            .mount(&server)
            .await;

        let msg = api(&server).create_message("c1", "hello").await.unwrap();
        assert_eq!(msg.id, "m9");
    }

    #[tokio::test]
    async fn test_mark_read() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/conversations/c1/read"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        api(&server).mark_read("c1").await.unwrap();
    }
}
