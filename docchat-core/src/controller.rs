//! Conversation state machine.
//!
//! `ConversationController` owns the active session id, its messages and its
//! documents. Route changes and user actions come in as method calls; results
//! of remote calls are applied only while the session they were issued for is
//! still the active one. Every activation bumps a generation counter and
//! replaces the session's `CancellationToken`, so fetches and reply streams
//! started for a session the user has left are dropped instead of applied.
//!
//! State sits behind an async mutex that is never held across a network call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::api::{ChatApi, HttpChatApi};
use crate::config::{ClientConfig, ConversationConfig};
use crate::error::{ChatError, Result};
use crate::models::{ChatSession, Message, Role, SessionDetail, UploadFile, UploadOutcome};
use crate::navigation::{Navigator, Route};
use crate::sessions::{title_from_message, SessionStore};
use crate::stream::{Completion, ReplyDecoder, ReplyEvent};
use crate::upload::UploadCoordinator;
use crate::view::{ControllerEvent, ConversationMessage, ConversationView, Delivery, Phase};

const SESSION_GONE: &str = "That conversation no longer exists.";

/// Result of a `submit` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Another send is in flight, or the text was blank.
    Rejected,
    Completed(Completion),
    /// The exchange failed; a notice was added to the conversation.
    Failed(String),
    /// The user left the session before the reply finished.
    Abandoned,
}

/// Identifies one activation of a session.
#[derive(Debug, Clone)]
struct Ticket {
    session_id: String,
    generation: u64,
    cancel: CancellationToken,
}

enum Started {
    Active(Ticket),
    Abandoned,
    Failed(String),
}

struct Inner {
    view: ConversationView,
    generation: u64,
    cancel: CancellationToken,
    /// The server has stored the pending user message.
    send_accepted: bool,
}

impl Inner {
    /// Make `id` the active session, cancelling work tied to the previous one.
    fn activate(&mut self, id: Option<String>) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.generation += 1;
        self.send_accepted = false;
        self.view.active_session = id;
        self.view.messages.clear();
        self.view.documents.clear();
    }

    fn ticket(&self) -> Option<Ticket> {
        self.view.active_session.as_ref().map(|id| Ticket {
            session_id: id.clone(),
            generation: self.generation,
            cancel: self.cancel.clone(),
        })
    }

    fn is_current(&self, ticket: &Ticket) -> bool {
        self.generation == ticket.generation
            && self.view.active_session.as_deref() == Some(ticket.session_id.as_str())
    }

    fn placeholder_mut(&mut self) -> Option<&mut ConversationMessage> {
        self.view
            .messages
            .iter_mut()
            .rev()
            .find(|m| m.delivery == Delivery::Streaming)
    }

    fn pending_user_mut(&mut self) -> Option<&mut ConversationMessage> {
        self.view
            .messages
            .iter_mut()
            .rev()
            .find(|m| m.delivery == Delivery::Tentative && m.role() == Role::User)
    }

    /// Replace the conversation with server state, keeping in-flight entries.
    ///
    /// Once the server has accepted a send, the last user message in its
    /// history is the pending one, and it replaces the tentative copy.
    fn apply_detail(&mut self, detail: SessionDetail) {
        let detail = detail.into_visible();
        let mut in_flight: Vec<ConversationMessage> = self
            .view
            .messages
            .drain(..)
            .filter(|m| m.delivery.is_in_flight())
            .collect();
        if self.send_accepted {
            if let Some(stored) = detail.messages.iter().rev().find(|m| m.role == Role::User) {
                in_flight.retain(|m| {
                    !(m.delivery == Delivery::Tentative
                        && m.role() == Role::User
                        && m.content() == stored.content)
                });
            }
        }
        self.view.messages = detail
            .messages
            .into_iter()
            .map(ConversationMessage::confirmed)
            .collect();
        self.view.messages.extend(in_flight);
        self.view.documents = detail.documents;
        if matches!(self.view.phase, Phase::Loading | Phase::ErrorShown) {
            self.view.phase = Phase::Ready;
        }
    }

    /// Show an error notice. A reply still streaming keeps `Sending`.
    fn show_error(&mut self, notice: String) -> Phase {
        self.view.notice = Some(notice);
        if self.view.phase != Phase::Sending {
            self.view.phase = Phase::ErrorShown;
        }
        self.view.phase
    }

    /// Drop the active session after the server reported it missing.
    fn forget_session(&mut self, id: &str) {
        self.activate(None);
        self.view.phase = Phase::Empty;
        self.view.sessions.remove(id);
        self.view.notice = Some(SESSION_GONE.to_string());
    }
}

/// Releases the single send slot when an episode ends, however it ends.
struct SendSlot<'a>(&'a AtomicBool);

impl<'a> SendSlot<'a> {
    fn claim(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SendSlot(flag))
    }
}

impl Drop for SendSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ConversationController {
    config: ConversationConfig,
    api: Arc<dyn ChatApi>,
    sessions: SessionStore,
    uploads: UploadCoordinator,
    navigator: Arc<dyn Navigator>,
    state: Mutex<Inner>,
    sending: AtomicBool,
    events: broadcast::Sender<ControllerEvent>,
}

impl ConversationController {
    pub fn new(
        config: &ClientConfig,
        api: Arc<dyn ChatApi>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.conversation.event_capacity.max(1));
        Self {
            config: config.conversation.clone(),
            sessions: SessionStore::new(api.clone()),
            uploads: UploadCoordinator::new(api.clone()),
            api,
            navigator,
            state: Mutex::new(Inner {
                view: ConversationView::default(),
                generation: 0,
                cancel: CancellationToken::new(),
                send_accepted: false,
            }),
            sending: AtomicBool::new(false),
            events,
        }
    }

    /// Controller talking HTTP to `config.api.base_url`.
    pub fn connect(config: &ClientConfig, navigator: Arc<dyn Navigator>) -> Result<Self> {
        let api: Arc<dyn ChatApi> = Arc::new(HttpChatApi::new(config)?);
        Ok(Self::new(config, api, navigator))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> ConversationView {
        self.state.lock().await.view.clone()
    }

    fn emit(&self, event: ControllerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // ------------------------------------------------------------------------
    // Session list
    // ------------------------------------------------------------------------

    /// Load the session list. On failure the current list is kept.
    pub async fn load_sessions(&self) -> Result<()> {
        let sessions = self.sessions.list().await.map_err(|e| {
            tracing::warn!(error = %e, "Failed to load session list");
            e
        })?;
        self.state.lock().await.view.sessions.replace(sessions);
        self.emit(ControllerEvent::SessionsChanged);
        Ok(())
    }

    async fn refresh_sessions(&self) {
        if let Err(e) = self.load_sessions().await {
            tracing::debug!(error = %e, "Session list refresh skipped");
        }
    }

    pub async fn rename_session(&self, id: &str, title: &str) -> Result<()> {
        let title = self.sessions.rename(id, title).await?;
        self.state.lock().await.view.sessions.rename(id, &title);
        self.emit(ControllerEvent::SessionsChanged);
        Ok(())
    }

    pub async fn delete_session(&self, id: &str) -> Result<()> {
        self.sessions.delete(id).await?;

        let was_active = {
            let mut inner = self.state.lock().await;
            inner.view.sessions.remove(id);
            let was_active = inner.view.active_session.as_deref() == Some(id);
            if was_active {
                inner.activate(None);
                inner.view.phase = Phase::Empty;
                inner.view.notice = None;
            }
            was_active
        };

        self.emit(ControllerEvent::SessionsChanged);
        if was_active {
            self.emit(ControllerEvent::ConversationChanged);
            self.emit(ControllerEvent::PhaseChanged(Phase::Empty));
            self.navigator.navigate(Route::Home).await;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------------

    /// React to the route switching to `id` (or to no session).
    pub async fn open_route(&self, id: Option<&str>) -> Result<()> {
        let ticket = {
            let mut inner = self.state.lock().await;
            match id {
                None => {
                    inner.activate(None);
                    inner.view.phase = Phase::Empty;
                    inner.view.notice = None;
                    None
                }
                Some(id) => {
                    let showing = inner.view.active_session.as_deref() == Some(id)
                        && !matches!(inner.view.phase, Phase::Empty | Phase::ErrorShown);
                    if showing {
                        // Echo of a navigation this controller started.
                        return Ok(());
                    }
                    inner.activate(Some(id.to_string()));
                    inner.view.phase = Phase::Loading;
                    inner.view.notice = None;
                    inner.ticket()
                }
            }
        };

        self.emit(ControllerEvent::ConversationChanged);
        match ticket {
            None => {
                self.emit(ControllerEvent::PhaseChanged(Phase::Empty));
                Ok(())
            }
            Some(ticket) => {
                self.emit(ControllerEvent::PhaseChanged(Phase::Loading));
                self.fetch_into(&ticket).await
            }
        }
    }

    /// Re-fetch the active session from the server.
    pub async fn reload(&self) -> Result<()> {
        let ticket = self.state.lock().await.ticket();
        match ticket {
            Some(ticket) => self.fetch_into(&ticket).await,
            None => Ok(()),
        }
    }

    async fn fetch_into(&self, ticket: &Ticket) -> Result<()> {
        let result = tokio::select! {
            _ = ticket.cancel.cancelled() => return Ok(()),
            r = self.api.fetch_session(&ticket.session_id) => r,
        };

        let mut inner = self.state.lock().await;
        if !inner.is_current(ticket) {
            tracing::debug!(session_id = %ticket.session_id, "Discarding stale session fetch");
            return Ok(());
        }

        match result {
            Ok(detail) => {
                inner.apply_detail(detail);
                let phase = inner.view.phase;
                drop(inner);
                self.emit(ControllerEvent::ConversationChanged);
                self.emit(ControllerEvent::PhaseChanged(phase));
                Ok(())
            }
            Err(ChatError::NotFound(what)) => {
                self.session_gone(inner, ticket).await;
                Err(ChatError::NotFound(what))
            }
            Err(e) => {
                tracing::warn!(session_id = %ticket.session_id, error = %e, "Failed to load session");
                let notice = format!("Could not load the conversation: {e}");
                let phase = inner.show_error(notice.clone());
                drop(inner);
                self.emit(ControllerEvent::Notice(notice));
                self.emit(ControllerEvent::PhaseChanged(phase));
                Err(e)
            }
        }
    }

    /// Fall back to the empty state for a session the server no longer has.
    async fn session_gone(&self, mut inner: MutexGuard<'_, Inner>, ticket: &Ticket) {
        tracing::info!(session_id = %ticket.session_id, "Session no longer exists");
        inner.forget_session(&ticket.session_id);
        drop(inner);
        self.emit(ControllerEvent::ConversationChanged);
        self.emit(ControllerEvent::SessionsChanged);
        self.emit(ControllerEvent::PhaseChanged(Phase::Empty));
        self.navigator.navigate(Route::Home).await;
    }

    /// Leave ErrorShown for the state underneath it.
    pub async fn dismiss_error(&self) {
        let phase = {
            let mut inner = self.state.lock().await;
            inner.view.notice = None;
            if inner.view.phase != Phase::ErrorShown {
                return;
            }
            inner.view.phase = if inner.view.active_session.is_some() {
                Phase::Ready
            } else {
                Phase::Empty
            };
            inner.view.phase
        };
        self.emit(ControllerEvent::PhaseChanged(phase));
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Send `text` to the active session, creating one first if there is none.
    pub async fn submit(&self, text: &str) -> SubmitOutcome {
        let text = text.trim();
        if text.is_empty() {
            return SubmitOutcome::Rejected;
        }
        let Some(_slot) = SendSlot::claim(&self.sending) else {
            tracing::debug!("Submit rejected: a reply is still streaming");
            return SubmitOutcome::Rejected;
        };

        let (ticket, generation) = {
            let mut inner = self.state.lock().await;
            inner.view.phase = Phase::Sending;
            inner.view.notice = None;
            (inner.ticket(), inner.generation)
        };
        self.emit(ControllerEvent::PhaseChanged(Phase::Sending));

        let ticket = match ticket {
            Some(ticket) => ticket,
            None => match self.start_session(text, generation).await {
                Started::Active(ticket) => ticket,
                Started::Abandoned => return SubmitOutcome::Abandoned,
                Started::Failed(notice) => return SubmitOutcome::Failed(notice),
            },
        };

        self.exchange(&ticket, text).await
    }

    /// Create a session for the first message and make it active once the
    /// navigator has committed the route to it.
    async fn start_session(&self, text: &str, generation: u64) -> Started {
        let title = title_from_message(text, self.config.title_max_chars);
        let session: ChatSession = match self.sessions.create(&title).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, "Could not create session for first message");
                let notice = format!("Could not start a new conversation: {e}");
                let mut inner = self.state.lock().await;
                if inner.generation == generation {
                    inner.view.phase = Phase::ErrorShown;
                    inner.view.notice = Some(notice.clone());
                    drop(inner);
                    self.emit(ControllerEvent::Notice(notice.clone()));
                    self.emit(ControllerEvent::PhaseChanged(Phase::ErrorShown));
                }
                return Started::Failed(notice);
            }
        };

        let ticket = {
            let mut inner = self.state.lock().await;
            inner.view.sessions.prepend(session.clone());
            if inner.generation != generation {
                None
            } else {
                inner.activate(Some(session.id.clone()));
                inner.view.phase = Phase::Sending;
                inner.ticket()
            }
        };
        self.emit(ControllerEvent::SessionsChanged);

        let Some(ticket) = ticket else {
            return Started::Abandoned;
        };
        self.emit(ControllerEvent::ConversationChanged);
        self.navigator
            .navigate(Route::Session(ticket.session_id.clone()))
            .await;
        Started::Active(ticket)
    }

    async fn exchange(&self, ticket: &Ticket, text: &str) -> SubmitOutcome {
        {
            let mut inner = self.state.lock().await;
            if !inner.is_current(ticket) {
                return SubmitOutcome::Abandoned;
            }
            inner.view.messages.push(ConversationMessage {
                message: Message::user(text),
                delivery: Delivery::Tentative,
            });
            inner.view.messages.push(ConversationMessage {
                message: Message::assistant(""),
                delivery: Delivery::Streaming,
            });
        }
        self.emit(ControllerEvent::ConversationChanged);

        let opened = tokio::select! {
            _ = ticket.cancel.cancelled() => return SubmitOutcome::Abandoned,
            r = self.api.send_message(&ticket.session_id, text) => r,
        };
        let chunks = match opened {
            Ok(chunks) => chunks,
            Err(ChatError::NotFound(_)) => {
                let inner = self.state.lock().await;
                if !inner.is_current(ticket) {
                    return SubmitOutcome::Abandoned;
                }
                self.session_gone(inner, ticket).await;
                return SubmitOutcome::Failed(SESSION_GONE.to_string());
            }
            Err(e) => return self.fail_exchange(ticket, e, false).await,
        };
        {
            let mut inner = self.state.lock().await;
            if !inner.is_current(ticket) {
                return SubmitOutcome::Abandoned;
            }
            inner.send_accepted = true;
        }

        let mut decoder = ReplyDecoder::new(chunks);
        loop {
            let event = tokio::select! {
                _ = ticket.cancel.cancelled() => return SubmitOutcome::Abandoned,
                ev = decoder.next_event() => ev,
            };

            match event {
                Ok(ReplyEvent::Token(fragment)) => {
                    {
                        let mut inner = self.state.lock().await;
                        if !inner.is_current(ticket) {
                            return SubmitOutcome::Abandoned;
                        }
                        if let Some(placeholder) = inner.placeholder_mut() {
                            placeholder.message.content.push_str(&fragment);
                        }
                    }
                    self.emit(ControllerEvent::Token {
                        session_id: ticket.session_id.clone(),
                        fragment,
                    });
                }
                Ok(ReplyEvent::Finished(completion)) => {
                    {
                        let mut inner = self.state.lock().await;
                        if !inner.is_current(ticket) {
                            return SubmitOutcome::Abandoned;
                        }
                        if let Some(user) = inner.pending_user_mut() {
                            user.delivery = Delivery::Confirmed;
                        }
                        if let Some(placeholder) = inner.placeholder_mut() {
                            placeholder.delivery = Delivery::Confirmed;
                        }
                        inner.send_accepted = false;
                        inner.view.phase = Phase::Ready;
                    }
                    tracing::debug!(
                        session_id = %ticket.session_id,
                        ?completion,
                        malformed = decoder.malformed_count(),
                        "Reply finished"
                    );
                    self.emit(ControllerEvent::ConversationChanged);
                    self.emit(ControllerEvent::PhaseChanged(Phase::Ready));
                    self.refresh_sessions().await;
                    return SubmitOutcome::Completed(completion);
                }
                Err(e) => return self.fail_exchange(ticket, e, true).await,
            }
        }
    }

    /// Roll back the optimistic exchange and add a failure notice.
    ///
    /// `accepted` tells whether the server took the message before failing.
    async fn fail_exchange(
        &self,
        ticket: &Ticket,
        error: ChatError,
        accepted: bool,
    ) -> SubmitOutcome {
        tracing::warn!(
            session_id = %ticket.session_id,
            error = %error,
            accepted,
            "Message exchange failed"
        );
        let mut inner = self.state.lock().await;
        if !inner.is_current(ticket) {
            return SubmitOutcome::Abandoned;
        }

        if let Some(pos) = inner
            .view
            .messages
            .iter()
            .rposition(|m| m.delivery == Delivery::Streaming)
        {
            if inner.view.messages[pos].content().is_empty() {
                inner.view.messages.remove(pos);
            } else {
                inner.view.messages[pos].delivery = Delivery::Failed;
            }
        }
        if let Some(user) = inner.pending_user_mut() {
            user.delivery = if accepted {
                Delivery::Confirmed
            } else {
                Delivery::Failed
            };
        }

        inner.send_accepted = false;
        let notice = format!("Sorry, the reply could not be completed: {error}");
        inner.view.messages.push(ConversationMessage {
            message: Message::assistant(notice.clone()),
            delivery: Delivery::Local,
        });
        inner.view.phase = Phase::Ready;
        drop(inner);

        self.emit(ControllerEvent::ConversationChanged);
        self.emit(ControllerEvent::PhaseChanged(Phase::Ready));
        SubmitOutcome::Failed(notice)
    }

    // ------------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------------

    /// Remove a document from the active session and re-fetch the session.
    pub async fn delete_document(&self, filename: &str) -> Result<()> {
        let ticket = self.require_ticket().await?;
        self.api
            .delete_document(&ticket.session_id, filename)
            .await?;
        tracing::info!(session_id = %ticket.session_id, filename, "Deleted document");
        self.fetch_into(&ticket).await
    }

    /// Raw bytes of a document in the active session, for preview.
    pub async fn document_bytes(&self, filename: &str) -> Result<bytes::Bytes> {
        let ticket = self.require_ticket().await?;
        self.api.fetch_document(&ticket.session_id, filename).await
    }

    async fn require_ticket(&self) -> Result<Ticket> {
        self.state
            .lock()
            .await
            .ticket()
            .ok_or_else(|| ChatError::InvalidInput("no active session".to_string()))
    }

    /// Upload into the active session, or into a session the server creates.
    ///
    /// Any success reply re-fetches the session, since the server is the
    /// authority on what it stored. Files the reply left unaccounted for are
    /// settled against the re-fetched document list.
    pub async fn upload(&self, files: &[UploadFile]) -> Result<UploadOutcome> {
        let (active, generation, before) = {
            let inner = self.state.lock().await;
            (
                inner.view.active_session.clone(),
                inner.generation,
                inner.view.documents.clone(),
            )
        };

        let events = self.events.clone();
        let mut outcome = self
            .uploads
            .upload(active.as_deref(), files, |status| {
                let _ = events.send(ControllerEvent::Progress(status.to_string()));
            })
            .await?;

        let (ticket, adopted) = {
            let mut inner = self.state.lock().await;
            if inner.generation != generation {
                tracing::debug!("Upload finished after the session changed; not applying");
                (None, false)
            } else {
                match (&active, &outcome.session_id) {
                    (Some(_), _) if outcome.accepted => (inner.ticket(), false),
                    (None, Some(created)) if outcome.may_have_stored() => {
                        inner.activate(Some(created.clone()));
                        inner.view.phase = Phase::Loading;
                        (inner.ticket(), true)
                    }
                    _ => (None, false),
                }
            }
        };

        if let Some(ticket) = &ticket {
            if adopted {
                self.emit(ControllerEvent::ConversationChanged);
                self.emit(ControllerEvent::PhaseChanged(Phase::Loading));
                self.navigator
                    .navigate(Route::Session(ticket.session_id.clone()))
                    .await;
            }
            if let Err(e) = self.fetch_into(ticket).await {
                tracing::warn!(error = %e, "Re-fetch after upload failed");
            }
            if !outcome.unconfirmed.is_empty() {
                let inner = self.state.lock().await;
                if inner.is_current(ticket) {
                    let before: &[_] = if adopted { &[] } else { &before };
                    outcome.settle(before, &inner.view.documents);
                }
            }
            self.refresh_sessions().await;
        }

        if !outcome.is_clean() {
            let summary = outcome.summary_line();
            let phase = {
                let mut inner = self.state.lock().await;
                let still_ours = match &ticket {
                    Some(ticket) => inner.is_current(ticket),
                    None => inner.generation == generation,
                };
                if !still_ours {
                    None
                } else if outcome.failed_count() > 0 {
                    Some(inner.show_error(summary.clone()))
                } else {
                    inner.view.notice = Some(summary.clone());
                    None
                }
            };
            self.emit(ControllerEvent::Notice(summary));
            if let Some(phase) = phase {
                self.emit(ControllerEvent::PhaseChanged(phase));
            }
        }
        Ok(outcome)
    }
}
