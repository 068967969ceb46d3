//! State the controller exposes to the presentation layer.

use crate::models::{DocumentMetadata, Message, Role};
use crate::sessions::SessionList;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// No active session.
    #[default]
    Empty,
    Loading,
    Ready,
    Sending,
    ErrorShown,
}

/// Where a message stands relative to server truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// As fetched from the server, or acknowledged by a finished reply.
    Confirmed,
    /// Optimistic user message awaiting the reply.
    Tentative,
    /// Assistant placeholder receiving tokens.
    Streaming,
    /// The exchange this message belongs to failed.
    Failed,
    /// Client-side notice that never reached the server.
    Local,
}

impl Delivery {
    pub fn is_in_flight(self) -> bool {
        matches!(self, Delivery::Tentative | Delivery::Streaming)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationMessage {
    pub message: Message,
    pub delivery: Delivery,
}

impl ConversationMessage {
    pub fn confirmed(message: Message) -> Self {
        Self {
            message,
            delivery: Delivery::Confirmed,
        }
    }

    pub fn role(&self) -> Role {
        self.message.role
    }

    pub fn content(&self) -> &str {
        &self.message.content
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationView {
    pub phase: Phase,
    pub active_session: Option<String>,
    pub sessions: SessionList,
    pub messages: Vec<ConversationMessage>,
    pub documents: Vec<DocumentMetadata>,
    /// Last error or upload summary shown to the user.
    pub notice: Option<String>,
}

impl ConversationView {
    pub fn last_message(&self) -> Option<&ConversationMessage> {
        self.messages.last()
    }
}

/// Change notifications for observers. Snapshots carry the full state.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    PhaseChanged(Phase),
    SessionsChanged,
    ConversationChanged,
    Token { session_id: String, fragment: String },
    Progress(String),
    Notice(String),
}
