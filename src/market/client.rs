//! Marketplace endpoints on top of the request pipeline.

use async_trait::async_trait;
use color_eyre::Result;
use serde_json::{json, Value};
use tracing::info;

use super::types::{Conversation, LoginResponse, Message, UnreadCount, UserSummary};
use crate::cache::Fetched;
use crate::http::{ApiError, ApiRequest, HttpClient};
use crate::sync::StreamSource;

/// Marketplace API client.
///
/// Reads go through the shared cache unless noted; writes invalidate the
/// cached reads they make stale.
#[derive(Clone)]
pub struct MarketClient {
  http: HttpClient,
}

impl MarketClient {
  pub fn new(http: HttpClient) -> Self {
    Self { http }
  }

  pub fn http(&self) -> &HttpClient {
    &self.http
  }

  /// Exchange credentials for a session token and store it.
  pub async fn login(&self, email: &str, password: &str) -> Result<Option<UserSummary>> {
    let request = ApiRequest::post("auth/login", json!({ "email": email, "password": password }));
    let response: LoginResponse = self.http.fetch_json(request).await?;
    self.http.session().login(&response.token)?;
    info!(email, "Logged in");
    Ok(response.user)
  }

  pub fn logout(&self) -> Result<()> {
    self.http.session().logout()
  }

  pub fn is_logged_in(&self) -> bool {
    self.http.session().token().is_some()
  }

  fn conversations_request() -> ApiRequest {
    ApiRequest::get("conversations")
  }

  /// List the user's conversations (cached).
  pub async fn conversations(&self) -> Result<Vec<Conversation>, ApiError> {
    self.http.fetch_json(Self::conversations_request()).await
  }

  /// Post a message; the cached conversation list is dropped on success.
  pub async fn send_message(&self, conversation_id: &str, body: &str) -> Result<Message, ApiError> {
    let request = ApiRequest::post(
      format!("conversations/{}/messages", conversation_id),
      json!({ "content": body }),
    );
    let message = self.http.fetch_json(request).await?;
    self.http.invalidate(&Self::conversations_request());
    Ok(message)
  }

  /// Unread notification count (cached with the short TTL class).
  pub async fn unread_count(&self) -> Result<u64, ApiError> {
    let count: UnreadCount = self
      .http
      .fetch_json(ApiRequest::get("notifications/unread-count"))
      .await?;
    Ok(count.count)
  }

  /// Arbitrary cached GET, for ad-hoc inspection.
  pub async fn get_raw(&self, path: &str, params: &[(String, String)]) -> Result<Fetched<Value>, ApiError> {
    let request = params
      .iter()
      .fold(ApiRequest::get(path), |request, (k, v)| request.param(k.clone(), v));
    self.http.fetch(request).await
  }

  /// Message stream source for one conversation.
  pub fn messages(&self, conversation_id: &str) -> ConversationMessages {
    ConversationMessages {
      http: self.http.clone(),
      conversation_id: conversation_id.to_string(),
    }
  }
}

/// The messages endpoint of one conversation.
///
/// Requests bypass the response cache: freshness of a chat is governed by the
/// poll interval, not by TTLs.
pub struct ConversationMessages {
  http: HttpClient,
  conversation_id: String,
}

impl ConversationMessages {
  pub fn conversation_id(&self) -> &str {
    &self.conversation_id
  }

  fn request(&self) -> ApiRequest {
    ApiRequest::get(format!("conversations/{}/messages", self.conversation_id)).bypass_cache()
  }
}

#[async_trait]
impl StreamSource<Message> for ConversationMessages {
  async fn latest(&self, limit: usize) -> Result<Vec<Message>, ApiError> {
    self.http.fetch_json(self.request().param("limit", limit)).await
  }

  async fn after(&self, last_seen_id: &str) -> Result<Vec<Message>, ApiError> {
    self
      .http
      .fetch_json(self.request().param("after", last_seen_id))
      .await
  }

  async fn before(&self, oldest_id: &str, limit: usize) -> Result<Vec<Message>, ApiError> {
    self
      .http
      .fetch_json(
        self
          .request()
          .param("before", oldest_id)
          .param("limit", limit),
      )
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::Source;
  use crate::http::{PipelineOptions, TtlPolicy};
  use crate::session::{Route, TokenStore};
  use crate::sync::{open_stream, visibility_channel, ScrollState, StreamSync};
  use crate::testing::{MemoryTokenStore, RecordingNavigator, Reply, ScriptedTransport};
  use std::sync::Arc;
  use std::time::Duration;

  fn client(token: Option<&str>) -> (MarketClient, Arc<ScriptedTransport>, Arc<MemoryTokenStore>) {
    let transport = Arc::new(ScriptedTransport::new());
    let tokens = Arc::new(MemoryTokenStore::new(token));
    let http = HttpClient::new(
      transport.clone(),
      tokens.clone(),
      Arc::new(RecordingNavigator::new(Route::Conversations)),
      PipelineOptions {
        ttl_policy: TtlPolicy::new(Duration::from_secs(300)),
        coalesce_grace: Duration::from_millis(100),
        session_cooldown: Duration::from_secs(1),
      },
    );
    (MarketClient::new(http), transport, tokens)
  }

  fn message(id: u32) -> Value {
    json!({
      "id": id.to_string(),
      "conversationId": "c1",
      "senderId": "u1",
      "body": format!("message {}", id),
      "createdAt": format!("2024-06-01T10:00:{:02}Z", id % 60),
    })
  }

  fn param<'a>(request: &'a ApiRequest, key: &str) -> Option<&'a str> {
    request
      .query
      .iter()
      .find(|(k, _)| k == key)
      .map(|(_, v)| v.as_str())
  }

  #[tokio::test(start_paused = true)]
  async fn test_login_stores_token() {
    let (client, transport, tokens) = client(None);
    transport.reply(
      "auth/login",
      Reply::json(json!({"token": "fresh", "user": {"id": "u1", "name": "Ana"}})),
    );

    let user = client.login("ana@example.com", "pw").await.unwrap();
    assert_eq!(user.map(|u| u.name).as_deref(), Some("Ana"));
    assert_eq!(tokens.load().as_deref(), Some("fresh"));
    assert!(client.is_logged_in());
  }

  #[tokio::test(start_paused = true)]
  async fn test_send_message_invalidates_conversation_list() {
    let (client, transport, _tokens) = client(Some("t0k3n"));
    transport.reply("conversations", Reply::json(json!([])));
    transport.reply("conversations/c1/messages", Reply::json(message(5)));

    client.conversations().await.unwrap();
    let sent = client.send_message("c1", "On my way").await.unwrap();
    assert_eq!(sent.id, "5");

    tokio::time::sleep(Duration::from_millis(150)).await;
    client.conversations().await.unwrap();
    assert_eq!(transport.calls("conversations"), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_get_raw_is_cached() {
    let (client, transport, _tokens) = client(Some("t0k3n"));
    transport.reply("vehicles", Reply::json(json!([{"id": "v1"}])));
    let params = vec![("city".to_string(), "Lisbon".to_string())];

    client.get_raw("vehicles", &params).await.unwrap();
    let second = client.get_raw("vehicles", &params).await.unwrap();
    assert_eq!(second.source, Source::Cache);
  }

  #[tokio::test(start_paused = true)]
  async fn test_conversation_scenario_end_to_end() {
    let (client, transport, _tokens) = client(Some("t0k3n"));
    let path = "conversations/c1/messages";
    transport.reply(path, Reply::json(json!([message(1), message(2)])));
    transport.reply(path, Reply::json(json!([message(3)])));
    transport.reply(path, Reply::json(json!([])));

    let sync = Arc::new(StreamSync::new(client.messages("c1"), 20));
    let (_signal, visibility) = visibility_channel(true);
    let scroll = ScrollState::new(3);
    scroll.set_layout(10, 2);
    let top_before = scroll.top();

    let handle = open_stream(
      Arc::clone(&sync),
      Duration::from_secs(20),
      (visibility.clone(), scroll.clone()),
      visibility,
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_secs(21)).await;

    let ids: Vec<String> = sync.items().into_iter().map(|m| m.id).collect();
    assert_eq!(ids, vec!["1", "2", "3"]);
    assert_eq!(sync.last_seen_id().as_deref(), Some("3"));
    assert_eq!(scroll.top(), top_before);

    let requests = transport.requests();
    assert_eq!(param(&requests[0], "limit"), Some("20"));
    assert_eq!(param(&requests[1], "after"), Some("2"));
    // Polls never populate the response cache.
    assert!(client.http().cache().is_empty());

    handle.close().await;
    assert!(sync.items().is_empty());
  }
}
