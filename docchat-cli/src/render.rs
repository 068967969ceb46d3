//! Terminal rendering of controller state and events.

use std::future::Future;
use std::io::Write;

use docchat_core::models::{ChatSession, DocumentMetadata, Role};
use docchat_core::{ControllerEvent, ConversationMessage, ConversationView, Delivery};
use tokio::sync::broadcast::{self, error::RecvError};

/// Drive `work` to completion while printing controller events as they
/// arrive, then print whatever was still queued when it finished.
pub async fn follow_events<F: Future>(
    events: &mut broadcast::Receiver<ControllerEvent>,
    work: F,
) -> F::Output {
    tokio::pin!(work);
    let output = loop {
        tokio::select! {
            output = &mut work => break output,
            event = events.recv() => match event {
                Ok(event) => render_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Terminal fell behind controller events");
                }
                Err(RecvError::Closed) => break (&mut work).await,
            },
        }
    };
    while let Ok(event) = events.try_recv() {
        render_event(&event);
    }
    output
}

fn render_event(event: &ControllerEvent) {
    match event {
        ControllerEvent::Token { fragment, .. } => {
            print!("{fragment}");
            let _ = std::io::stdout().flush();
        }
        ControllerEvent::Progress(status) => eprintln!("{status}"),
        ControllerEvent::Notice(notice) => eprintln!("! {notice}"),
        ControllerEvent::PhaseChanged(_)
        | ControllerEvent::SessionsChanged
        | ControllerEvent::ConversationChanged => {}
    }
}

pub fn print_sessions(sessions: &[ChatSession]) {
    if sessions.is_empty() {
        eprintln!("No sessions yet.");
        return;
    }
    for session in sessions {
        println!("{}", session_line(session));
    }
}

pub fn print_conversation(view: &ConversationView) {
    let Some(id) = &view.active_session else {
        eprintln!("New conversation. Your first message or upload starts a session.");
        return;
    };
    let title = view
        .sessions
        .get(id)
        .map(|s| s.title.as_str())
        .unwrap_or("untitled");
    println!("== {title} ({id}) ==");
    for message in &view.messages {
        println!("{}\n", message_block(message));
    }
    print_documents(&view.documents);
}

pub fn print_documents(documents: &[DocumentMetadata]) {
    if documents.is_empty() {
        return;
    }
    println!("Documents:");
    for document in documents {
        println!("  {}", document_line(document));
    }
}

pub fn session_line(session: &ChatSession) -> String {
    format!(
        "{}  {}  {}",
        session.id,
        session.updated_at.format("%Y-%m-%d %H:%M"),
        session.title
    )
}

pub fn message_block(message: &ConversationMessage) -> String {
    let speaker = match message.role() {
        Role::User => "you",
        Role::Assistant => "assistant",
        Role::System => "system",
    };
    let marker = match message.delivery {
        Delivery::Confirmed => "",
        Delivery::Tentative | Delivery::Streaming => " ...",
        Delivery::Failed => " (failed)",
        Delivery::Local => " (not sent)",
    };
    format!("[{speaker}{marker}] {}", message.content())
}

pub fn document_line(document: &DocumentMetadata) -> String {
    format!("{}  {}", document.filename, human_size(document.size))
}

pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docchat_core::models::Message;

    #[test]
    fn test_human_size_units() {
        assert_eq!(human_size(0), "0 B");
        assert_eq!(human_size(1023), "1023 B");
        assert_eq!(human_size(1536), "1.5 KB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_message_block_marks_delivery() {
        let failed = ConversationMessage {
            message: Message::user("hello"),
            delivery: Delivery::Failed,
        };
        assert_eq!(message_block(&failed), "[you (failed)] hello");

        let confirmed = ConversationMessage::confirmed(Message::assistant("Hi!"));
        assert_eq!(message_block(&confirmed), "[assistant] Hi!");

        let notice = ConversationMessage {
            message: Message::assistant("Sorry"),
            delivery: Delivery::Local,
        };
        assert_eq!(message_block(&notice), "[assistant (not sent)] Sorry");
    }

    #[test]
    fn test_session_line_shows_id_and_title() {
        let session: ChatSession = serde_json::from_value(serde_json::json!({
            "id": "abc",
            "title": "Budget",
            "updated_at": "2024-05-01T10:30:00"
        }))
        .unwrap();
        assert_eq!(session_line(&session), "abc  2024-05-01 10:30  Budget");
    }

    #[tokio::test]
    async fn test_follow_events_returns_work_output() {
        let (tx, mut rx) = broadcast::channel(8);
        let output = follow_events(&mut rx, async move {
            tx.send(ControllerEvent::SessionsChanged).unwrap();
            42
        })
        .await;
        assert_eq!(output, 42);
        assert!(rx.try_recv().is_err());
    }
}
