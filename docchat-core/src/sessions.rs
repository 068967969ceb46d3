//! Session list access.
//!
//! `SessionStore` is a typed accessor over the remote session endpoints. It
//! holds no state: the caller owns the in-memory `SessionList` and applies a
//! change only after the matching remote call succeeded.

use std::sync::Arc;

use crate::api::ChatApi;
use crate::error::{ChatError, Result};
use crate::models::ChatSession;

#[derive(Clone)]
pub struct SessionStore {
    api: Arc<dyn ChatApi>,
}

impl SessionStore {
    pub fn new(api: Arc<dyn ChatApi>) -> Self {
        Self { api }
    }

    pub async fn list(&self) -> Result<Vec<ChatSession>> {
        let sessions = self.api.list_sessions().await?;
        tracing::debug!(count = sessions.len(), "Fetched session list");
        Ok(sessions)
    }

    pub async fn create(&self, title: &str) -> Result<ChatSession> {
        let title = normalize_title(title)?;
        let session = self.api.create_session(&title).await?;
        tracing::info!(session_id = %session.id, title = %session.title, "Created session");
        Ok(session)
    }

    pub async fn rename(&self, id: &str, title: &str) -> Result<String> {
        let title = normalize_title(title)?;
        self.api.rename_session(id, &title).await?;
        tracing::info!(session_id = %id, title = %title, "Renamed session");
        Ok(title)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.api.delete_session(id).await?;
        tracing::info!(session_id = %id, "Deleted session");
        Ok(())
    }
}

fn normalize_title(title: &str) -> Result<String> {
    let title = title.trim();
    if title.is_empty() {
        return Err(ChatError::InvalidInput("session title is empty".to_string()));
    }
    Ok(title.to_string())
}

/// Title for a session created from its first message: the first non-empty
/// line, capped at `max_chars` characters, with an ellipsis when cut.
pub fn title_from_message(text: &str, max_chars: usize) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    let mut title: String = line.chars().take(max_chars).collect();
    if line.chars().count() > max_chars {
        title.push_str("...");
    }
    title
}

/// Most-recent-first session list as last confirmed by the server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionList {
    sessions: Vec<ChatSession>,
}

impl SessionList {
    pub fn replace(&mut self, sessions: Vec<ChatSession>) {
        self.sessions = sessions;
    }

    /// Insert a newly created session at the front; an existing entry with
    /// the same id is replaced.
    pub fn prepend(&mut self, session: ChatSession) {
        self.sessions.retain(|s| s.id != session.id);
        self.sessions.insert(0, session);
    }

    pub fn rename(&mut self, id: &str, title: &str) -> bool {
        match self.sessions.iter_mut().find(|s| s.id == id) {
            Some(session) => {
                session.title = title.to_string();
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|s| s.id != id);
        self.sessions.len() != before
    }

    pub fn get(&self, id: &str) -> Option<&ChatSession> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn as_slice(&self) -> &[ChatSession] {
        &self.sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
