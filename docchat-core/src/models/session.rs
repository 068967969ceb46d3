use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::{DocumentMetadata, Message};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    #[serde(default = "default_title", deserialize_with = "title_or_default")]
    pub title: String,
    #[serde(alias = "updatedAt", deserialize_with = "super::timestamp::deserialize")]
    pub updated_at: DateTime<Utc>,
    #[serde(
        default,
        alias = "createdAt",
        deserialize_with = "super::timestamp::deserialize_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

fn default_title() -> String {
    "New Chat".to_string()
}

fn title_or_default<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_else(default_title))
}

/// Body of `GET /chats/:id`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SessionDetail {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub documents: Vec<DocumentMetadata>,
}

impl SessionDetail {
    /// Drops entries the server has soft-deleted.
    pub fn into_visible(self) -> Self {
        Self {
            messages: self.messages.into_iter().filter(|m| !m.is_deleted).collect(),
            documents: self.documents.into_iter().filter(|d| !d.is_deleted).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    #[test]
    fn test_session_accepts_snake_and_camel_timestamps() {
        let snake: ChatSession = serde_json::from_value(serde_json::json!({
            "id": "s1", "title": "Test", "updated_at": "2025-01-02T03:04:05"
        }))
        .unwrap();
        let camel: ChatSession = serde_json::from_value(serde_json::json!({
            "id": "s1", "title": "Test", "updatedAt": "2025-01-02T03:04:05Z"
        }))
        .unwrap();
        assert_eq!(snake.updated_at, camel.updated_at);
        assert_eq!(snake.id, "s1");
    }

    #[test]
    fn test_null_title_falls_back() {
        let session: ChatSession = serde_json::from_value(serde_json::json!({
            "id": "s2", "title": null, "updated_at": "2025-01-02T03:04:05Z"
        }))
        .unwrap();
        assert_eq!(session.title, "New Chat");
    }

    #[test]
    fn test_detail_hides_soft_deleted_entries() {
        let detail: SessionDetail = serde_json::from_value(serde_json::json!({
            "id": "s1",
            "title": "ignored",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "system", "content": "gone", "is_deleted": true}
            ],
            "documents": [
                {"filename": "a.pdf", "size": 10, "uploaded_at": "2025-01-02T03:04:05Z", "is_deleted": true}
            ]
        }))
        .unwrap();

        let visible = detail.into_visible();
        assert_eq!(visible.messages.len(), 1);
        assert_eq!(visible.messages[0].role, Role::User);
        assert!(visible.documents.is_empty());
    }
}
