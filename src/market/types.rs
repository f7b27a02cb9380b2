use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sync::Record;

/// A chat message between a renter and a vehicle owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
  #[serde(alias = "_id")]
  pub id: String,
  pub conversation_id: String,
  pub sender_id: String,
  #[serde(default)]
  pub sender_name: Option<String>,
  #[serde(alias = "content")]
  pub body: String,
  pub created_at: DateTime<Utc>,
}

impl Record for Message {
  fn record_id(&self) -> &str {
    &self.id
  }

  fn created_at(&self) -> DateTime<Utc> {
    self.created_at
  }
}

/// Conversation summary for list views
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
  #[serde(alias = "_id")]
  pub id: String,
  pub counterpart_name: String,
  #[serde(default)]
  pub vehicle_title: Option<String>,
  #[serde(default)]
  pub last_message: Option<String>,
  #[serde(default)]
  pub updated_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub unread: u32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct UnreadCount {
  pub count: u64,
}

/// The signed-in user, as returned by login
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
  #[serde(alias = "_id")]
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
  pub token: String,
  #[serde(default)]
  pub user: Option<UserSummary>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_message_accepts_server_field_names() {
    let message: Message = serde_json::from_value(json!({
      "_id": "66b1",
      "conversationId": "c1",
      "senderId": "u2",
      "content": "Keys are in the lockbox",
      "createdAt": "2024-06-01T10:00:00Z"
    }))
    .unwrap();

    assert_eq!(message.record_id(), "66b1");
    assert_eq!(message.body, "Keys are in the lockbox");
    assert_eq!(message.sender_name, None);
  }
}
