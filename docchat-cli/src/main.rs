//! docchat-cli: terminal front end for document-grounded chat sessions.
//!
//! # Subcommands
//! - `sessions`                             list sessions, most recent first
//! - `show <id>`                            print messages and documents
//! - `rename <id> <title>`                  rename a session
//! - `delete <id>`                          delete a session
//! - `send [--session ID] <message>`        send one message, stream the reply
//! - `upload [--session ID] <paths...>`     upload documents in one batch
//! - `download <id> <filename> [-o PATH]`   save a document to disk
//! - `chat [--session ID]`                  interactive loop

mod render;
mod repl;

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use docchat_core::models::UploadFile;
use docchat_core::{ClientConfig, ConversationController, MemoryNavigator, SubmitOutcome};
use tracing_subscriber::{fmt, EnvFilter};

use render::{follow_events, human_size, print_conversation, print_sessions};

const DEFAULT_CONFIG: &str = "~/.config/docchat/docchat.toml";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "docchat-cli",
    version,
    about = "Chat with your documents from the terminal"
)]
struct Cli {
    /// Chat server URL (overrides api.base_url from the config file)
    #[arg(long, env = "DOCCHAT_SERVER_URL")]
    server: Option<String>,

    /// Config file; a missing file means defaults
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List sessions, most recent first
    Sessions,

    /// Print a session's messages and documents
    Show { id: String },

    /// Rename a session
    Rename {
        id: String,
        #[arg(required = true, num_args = 1..)]
        title: Vec<String>,
    },

    /// Delete a session
    Delete { id: String },

    /// Send one message and stream the reply
    Send {
        /// Session to send to; a new one is created when omitted
        #[arg(short, long)]
        session: Option<String>,
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,
    },

    /// Upload documents in one batch
    Upload {
        /// Session to upload into; a new one is created when omitted
        #[arg(short, long)]
        session: Option<String>,
        #[arg(required = true, num_args = 1..)]
        paths: Vec<String>,
    },

    /// Save a session document to disk
    Download {
        id: String,
        filename: String,
        /// Output path (defaults to the document's filename)
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Interactive chat
    Chat {
        #[arg(short, long)]
        session: Option<String>,
    },
}

fn load_config(path: &str, server: Option<String>) -> anyhow::Result<ClientConfig> {
    let path = shellexpand::tilde(path);
    let config = ClientConfig::load_or_default(&path)
        .with_context(|| format!("failed to load config from {path}"))?;
    Ok(match server {
        Some(url) => config.with_base_url(url),
        None => config,
    })
}

pub(crate) async fn read_files(paths: &[String]) -> anyhow::Result<Vec<UploadFile>> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let path = shellexpand::tilde(path);
        let file = UploadFile::from_path(&*path)
            .await
            .with_context(|| format!("could not read {path}"))?;
        files.push(file);
    }
    Ok(files)
}

// ============================================================================
// Commands
// ============================================================================

async fn open(controller: &ConversationController, id: &str) -> anyhow::Result<()> {
    controller
        .open_route(Some(id))
        .await
        .with_context(|| format!("could not open session {id}"))
}

async fn do_sessions(controller: &ConversationController) -> anyhow::Result<()> {
    controller
        .load_sessions()
        .await
        .context("could not load sessions")?;
    print_sessions(controller.snapshot().await.sessions.as_slice());
    Ok(())
}

async fn do_show(controller: &ConversationController, id: &str) -> anyhow::Result<()> {
    // Best effort; only used for the title line.
    let _ = controller.load_sessions().await;
    open(controller, id).await?;
    print_conversation(&controller.snapshot().await);
    Ok(())
}

async fn do_send(
    controller: &ConversationController,
    session: Option<&str>,
    text: &str,
) -> anyhow::Result<()> {
    if let Some(id) = session {
        open(controller, id).await?;
    }
    let mut events = controller.subscribe();
    let outcome = follow_events(&mut events, controller.submit(text)).await;
    println!();

    if session.is_none() {
        if let Some(id) = controller.snapshot().await.active_session {
            eprintln!("session: {id}");
        }
    }
    match outcome {
        SubmitOutcome::Completed(_) => Ok(()),
        SubmitOutcome::Failed(notice) => bail!(notice),
        SubmitOutcome::Rejected => bail!("nothing to send"),
        SubmitOutcome::Abandoned => bail!("reply was abandoned"),
    }
}

async fn do_upload(
    controller: &ConversationController,
    session: Option<&str>,
    paths: &[String],
) -> anyhow::Result<()> {
    if let Some(id) = session {
        open(controller, id).await?;
    }
    let files = read_files(paths).await?;
    let mut events = controller.subscribe();
    let outcome = follow_events(&mut events, controller.upload(&files)).await?;

    if let Some(id) = &outcome.session_id {
        eprintln!("session: {id}");
    }
    if outcome.failed_count() > 0 {
        bail!(outcome.summary_line());
    }
    Ok(())
}

async fn do_download(
    controller: &ConversationController,
    id: &str,
    filename: &str,
    output: Option<&str>,
) -> anyhow::Result<()> {
    open(controller, id).await?;
    let bytes = controller
        .document_bytes(filename)
        .await
        .with_context(|| format!("could not download {filename}"))?;
    let target = match output {
        Some(path) => shellexpand::tilde(path).into_owned(),
        None => filename.to_string(),
    };
    tokio::fs::write(&target, &bytes)
        .await
        .with_context(|| format!("could not write {target}"))?;
    eprintln!("Saved {} to {target}", human_size(bytes.len() as u64));
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli.config, cli.server)?;
    let navigator = Arc::new(MemoryNavigator::new());
    let controller = ConversationController::connect(&config, navigator.clone())
        .with_context(|| format!("cannot use server URL {}", config.api.base_url))?;
    tracing::debug!(server = %config.base_url(), "Client ready");

    match cli.command {
        Commands::Sessions => do_sessions(&controller).await,
        Commands::Show { id } => do_show(&controller, &id).await,
        Commands::Rename { id, title } => {
            controller
                .rename_session(&id, &title.join(" "))
                .await
                .with_context(|| format!("could not rename session {id}"))?;
            eprintln!("Renamed {id}");
            Ok(())
        }
        Commands::Delete { id } => {
            controller
                .delete_session(&id)
                .await
                .with_context(|| format!("could not delete session {id}"))?;
            eprintln!("Deleted {id}");
            Ok(())
        }
        Commands::Send { session, message } => {
            do_send(&controller, session.as_deref(), &message.join(" ")).await
        }
        Commands::Upload { session, paths } => {
            do_upload(&controller, session.as_deref(), &paths).await
        }
        Commands::Download {
            id,
            filename,
            output,
        } => do_download(&controller, &id, &filename, output.as_deref()).await,
        Commands::Chat { session } => repl::run(&controller, &navigator, session).await,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_joins_message_words() {
        let cli = Cli::try_parse_from(["docchat-cli", "send", "-s", "abc", "what", "is", "this?"])
            .unwrap();
        match cli.command {
            Commands::Send { session, message } => {
                assert_eq!(session.as_deref(), Some("abc"));
                assert_eq!(message.join(" "), "what is this?");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_upload_requires_paths() {
        assert!(Cli::try_parse_from(["docchat-cli", "upload"]).is_err());
        let cli = Cli::try_parse_from(["docchat-cli", "upload", "a.pdf", "b.pdf"]).unwrap();
        match cli.command {
            Commands::Upload { session, paths } => {
                assert!(session.is_none());
                assert_eq!(paths, vec!["a.pdf", "b.pdf"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_server_flag_and_download_output() {
        let cli = Cli::try_parse_from([
            "docchat-cli",
            "--server",
            "http://chat.internal:9000",
            "download",
            "s1",
            "report.pdf",
            "-o",
            "/tmp/r.pdf",
        ])
        .unwrap();
        assert_eq!(cli.server.as_deref(), Some("http://chat.internal:9000"));
        match cli.command {
            Commands::Download {
                id,
                filename,
                output,
            } => {
                assert_eq!(id, "s1");
                assert_eq!(filename, "report.pdf");
                assert_eq!(output.as_deref(), Some("/tmp/r.pdf"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_missing_config_file_uses_defaults_with_server_override() {
        let config = load_config(
            "/nonexistent/docchat-test.toml",
            Some("http://localhost:1234/".to_string()),
        )
        .unwrap();
        assert_eq!(config.base_url(), "http://localhost:1234");
        assert_eq!(config.conversation.title_max_chars, 30);
    }

    #[tokio::test]
    async fn test_read_files_reports_missing_path() {
        let err = read_files(&["/nonexistent/missing.pdf".to_string()])
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("missing.pdf"));
    }
}
