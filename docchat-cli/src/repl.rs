//! Interactive chat loop.
//!
//! The navigator's route is the source of truth for which session is shown.
//! Commands move the route; after each command the loop hands any committed
//! route change to the controller, which ignores echoes of navigations it
//! started itself.

use docchat_core::{
    ControllerEvent, ConversationController, MemoryNavigator, Navigator, Route, SubmitOutcome,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch};

use crate::read_files;
use crate::render::{follow_events, print_conversation, print_documents, print_sessions};

const HELP: &str = "\
Commands:
  /open <id>         switch to a session
  /new               start a new conversation
  /rename <title>    rename the current session
  /delete [id]       delete a session (default: current)
  /upload <path>...  upload documents
  /docs              list documents in the current session
  /rmdoc <filename>  remove a document
  /sessions          list sessions
  /quit              leave
Anything else is sent as a message.";

#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Message(String),
    Open(String),
    New,
    Rename(String),
    Delete(Option<String>),
    Upload(Vec<String>),
    Docs,
    RemoveDoc(String),
    Sessions,
    Help,
    Quit,
    Blank,
    Invalid(String),
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Blank;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Message(line.to_string());
    };
    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };

    match (name, rest) {
        ("quit" | "exit" | "q", _) => Input::Quit,
        ("help" | "?", _) => Input::Help,
        ("new", _) => Input::New,
        ("sessions" | "ls", _) => Input::Sessions,
        ("docs", _) => Input::Docs,
        ("open", "") => Input::Invalid("usage: /open <session-id>".to_string()),
        ("open", id) => Input::Open(id.to_string()),
        ("rename", "") => Input::Invalid("usage: /rename <title>".to_string()),
        ("rename", title) => Input::Rename(title.to_string()),
        ("delete", "") => Input::Delete(None),
        ("delete", id) => Input::Delete(Some(id.to_string())),
        ("upload", "") => Input::Invalid("usage: /upload <path>...".to_string()),
        ("upload", paths) => Input::Upload(paths.split_whitespace().map(String::from).collect()),
        ("rmdoc", "") => Input::Invalid("usage: /rmdoc <filename>".to_string()),
        ("rmdoc", filename) => Input::RemoveDoc(filename.to_string()),
        _ => Input::Invalid(format!("unknown command /{name}, try /help")),
    }
}

fn report<T>(result: docchat_core::Result<T>) {
    if let Err(e) = result {
        eprintln!("! {e}");
    }
}

/// Hand a committed route change to the controller. Returns whether the
/// shown session changed.
async fn follow_route(
    controller: &ConversationController,
    routes: &mut watch::Receiver<Route>,
    events: &mut broadcast::Receiver<ControllerEvent>,
) -> bool {
    if !routes.has_changed().unwrap_or(false) {
        return false;
    }
    let route = routes.borrow_and_update().clone();
    let showing = controller.snapshot().await.active_session;
    if route.session_id() == showing.as_deref() {
        return false;
    }
    report(follow_events(events, controller.open_route(route.session_id())).await);
    true
}

pub async fn run(
    controller: &ConversationController,
    navigator: &MemoryNavigator,
    session: Option<String>,
) -> anyhow::Result<()> {
    let mut events = controller.subscribe();
    let mut routes = navigator.subscribe();

    if let Err(e) = controller.load_sessions().await {
        eprintln!("! could not load sessions: {e}");
    }
    if let Some(id) = session {
        navigator.navigate(Route::Session(id)).await;
    }
    follow_route(controller, &mut routes, &mut events).await;
    print_conversation(&controller.snapshot().await);
    eprintln!("Type a message, or /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("> ");
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let active = controller.snapshot().await.active_session;

        match parse_input(&line) {
            Input::Quit => break,
            Input::Blank => {}
            Input::Help => eprintln!("{HELP}"),
            Input::Invalid(usage) => eprintln!("{usage}"),
            Input::Message(text) => {
                let outcome = follow_events(&mut events, controller.submit(&text)).await;
                println!();
                match outcome {
                    SubmitOutcome::Failed(notice) => eprintln!("! {notice}"),
                    SubmitOutcome::Rejected => eprintln!("Still waiting for the previous reply."),
                    SubmitOutcome::Completed(_) | SubmitOutcome::Abandoned => {}
                }
            }
            Input::Open(id) => navigator.navigate(Route::Session(id)).await,
            Input::New => navigator.navigate(Route::Home).await,
            Input::Rename(title) => match active {
                Some(id) => report(controller.rename_session(&id, &title).await),
                None => eprintln!("No active session to rename."),
            },
            Input::Delete(target) => match target.or(active) {
                Some(id) => {
                    report(follow_events(&mut events, controller.delete_session(&id)).await);
                }
                None => eprintln!("No active session to delete."),
            },
            Input::Upload(paths) => match read_files(&paths).await {
                Ok(files) => {
                    let outcome = follow_events(&mut events, controller.upload(&files)).await;
                    report(outcome);
                }
                Err(e) => eprintln!("! {e:#}"),
            },
            Input::Docs => {
                let view = controller.snapshot().await;
                if view.documents.is_empty() {
                    eprintln!("No documents.");
                }
                print_documents(&view.documents);
            }
            Input::RemoveDoc(filename) => {
                report(follow_events(&mut events, controller.delete_document(&filename)).await);
            }
            Input::Sessions => {
                report(controller.load_sessions().await);
                print_sessions(controller.snapshot().await.sessions.as_slice());
            }
        }

        if follow_route(controller, &mut routes, &mut events).await {
            print_conversation(&controller.snapshot().await);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_a_message() {
        assert_eq!(
            parse_input("  what does section 2 say?  "),
            Input::Message("what does section 2 say?".to_string())
        );
        assert_eq!(parse_input("   "), Input::Blank);
    }

    #[test]
    fn test_commands_with_arguments() {
        assert_eq!(parse_input("/open abc-123"), Input::Open("abc-123".to_string()));
        assert_eq!(
            parse_input("/rename Q3 planning notes"),
            Input::Rename("Q3 planning notes".to_string())
        );
        assert_eq!(
            parse_input("/upload a.pdf ~/docs/b.pdf"),
            Input::Upload(vec!["a.pdf".to_string(), "~/docs/b.pdf".to_string()])
        );
        assert_eq!(parse_input("/rmdoc a.pdf"), Input::RemoveDoc("a.pdf".to_string()));
        assert_eq!(parse_input("/delete"), Input::Delete(None));
        assert_eq!(parse_input("/delete s9"), Input::Delete(Some("s9".to_string())));
    }

    #[test]
    fn test_bare_commands() {
        assert_eq!(parse_input("/quit"), Input::Quit);
        assert_eq!(parse_input("/q"), Input::Quit);
        assert_eq!(parse_input("/new"), Input::New);
        assert_eq!(parse_input("/docs"), Input::Docs);
        assert_eq!(parse_input("/sessions"), Input::Sessions);
    }

    #[test]
    fn test_missing_arguments_and_unknown_commands() {
        assert!(matches!(parse_input("/open"), Input::Invalid(_)));
        assert!(matches!(parse_input("/rename   "), Input::Invalid(_)));
        assert!(matches!(parse_input("/upload"), Input::Invalid(_)));
        assert!(matches!(parse_input("/frobnicate"), Input::Invalid(_)));
    }
}
