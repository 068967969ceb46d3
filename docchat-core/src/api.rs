//! HTTP access to the chat backend.
//!
//! `ChatApi` is the seam the rest of the crate talks to; `HttpChatApi` is the
//! reqwest implementation used in production and against wiremock in tests.
//!
//! Endpoints:
//! - GET    /chats  list sessions
//! - POST   /chats  create session
//! - GET    /chats/:id  messages + documents
//! - PATCH  /chats/:id  rename
//! - DELETE /chats/:id  delete session
//! - POST   /chats/:id/message  streamed reply
//! - POST   /chats/:id/upload  multipart batch upload
//! - GET    /chats/:id/documents/:filename  raw document bytes
//! - DELETE /chats/:id/documents/:filename  remove document

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::{ApiConfig, ClientConfig};
use crate::error::{ChatError, Result};
use crate::models::{ChatSession, SessionDetail, UploadFile};

/// Raw chunks of a streamed response body, in transport order.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Abstraction over the chat backend.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_sessions(&self) -> Result<Vec<ChatSession>>;

    async fn create_session(&self, title: &str) -> Result<ChatSession>;

    /// Fails with `ChatError::NotFound` for unknown ids.
    async fn fetch_session(&self, id: &str) -> Result<SessionDetail>;

    async fn rename_session(&self, id: &str, title: &str) -> Result<()>;

    async fn delete_session(&self, id: &str) -> Result<()>;

    /// Opens the reply stream. Resolves once the server accepted the message;
    /// the body is consumed through the returned stream.
    async fn send_message(&self, id: &str, message: &str) -> Result<ByteStream>;

    /// Posts one multipart batch and returns the undecoded reply body.
    async fn upload(&self, id: &str, files: &[UploadFile]) -> Result<Bytes>;

    async fn delete_document(&self, id: &str, filename: &str) -> Result<()>;

    async fn fetch_document(&self, id: &str, filename: &str) -> Result<Bytes>;
}

// ============================================================================
// Wire structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct TitleBody<'a> {
    title: &'a str,
}

#[derive(Debug, Serialize)]
struct MessageBody<'a> {
    message: &'a str,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: Option<serde_json::Value>,
}

// ============================================================================
// HttpChatApi
// ============================================================================

#[derive(Debug, Clone)]
pub struct HttpChatApi {
    client: Client,
    base_url: Url,
    config: ApiConfig,
}

impl HttpChatApi {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let base_url = Url::parse(config.base_url()).map_err(|e| {
            ChatError::InvalidInput(format!("invalid base URL {}: {}", config.api.base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ChatError::InvalidInput(format!(
                "base URL {} cannot carry paths",
                config.api.base_url
            )));
        }

        // No client-wide timeout: it would also cap streamed replies.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url,
            config: config.api.clone(),
        })
    }

    /// Joins percent-encoded path segments onto the base URL.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    /// Retries transient failures of an idempotent request.
    async fn idempotent<T, F, Fut>(&self, op: &'static str, action: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms.max(1))
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(self.config.max_retries);

        RetryIf::spawn(strategy, action, |e: &ChatError| {
            let retry = e.is_transient();
            if retry {
                tracing::debug!(op, error = %e, "Retrying transient failure");
            }
            retry
        })
        .await
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: Url, what: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout())
            .send()
            .await?;
        let response = check_status(response, what).await?;
        Ok(response.json().await?)
    }
}

/// Maps non-success statuses onto `ChatError`, keeping the server's detail text.
async fn check_status(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND {
        return Err(ChatError::NotFound(what.to_string()));
    }

    let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|e| e.detail)
        .map(|d| match d {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        })
        .unwrap_or(body);

    tracing::warn!(status = status.as_u16(), message = %message, what, "Chat API error");
    Err(ChatError::Api {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_sessions(&self) -> Result<Vec<ChatSession>> {
        let url = &self.endpoint(&["chats"]);
        self.idempotent("list_sessions", move || {
            self.get_json(url.clone(), "session list")
        })
        .await
    }

    async fn create_session(&self, title: &str) -> Result<ChatSession> {
        let response = self
            .client
            .post(self.endpoint(&["chats"]))
            .timeout(self.request_timeout())
            .json(&TitleBody { title })
            .send()
            .await?;
        let response = check_status(response, "session create").await?;
        Ok(response.json().await?)
    }

    async fn fetch_session(&self, id: &str) -> Result<SessionDetail> {
        let url = &self.endpoint(&["chats", id]);
        let what = &format!("session {id}");
        self.idempotent("fetch_session", move || self.get_json(url.clone(), what))
            .await
    }

    async fn rename_session(&self, id: &str, title: &str) -> Result<()> {
        let response = self
            .client
            .patch(self.endpoint(&["chats", id]))
            .timeout(self.request_timeout())
            .json(&TitleBody { title })
            .send()
            .await?;
        check_status(response, &format!("session {id}")).await?;
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.endpoint(&["chats", id]))
            .timeout(self.request_timeout())
            .send()
            .await?;
        check_status(response, &format!("session {id}")).await?;
        Ok(())
    }

    async fn send_message(&self, id: &str, message: &str) -> Result<ByteStream> {
        let response = self
            .client
            .post(self.endpoint(&["chats", id, "message"]))
            .json(&MessageBody { message })
            .send()
            .await?;
        let response = check_status(response, &format!("session {id}")).await?;
        Ok(response.bytes_stream().map_err(ChatError::from).boxed())
    }

    async fn upload(&self, id: &str, files: &[UploadFile]) -> Result<Bytes> {
        let mut form = Form::new();
        for file in files {
            let mut part = Part::bytes(file.bytes.to_vec()).file_name(file.filename.clone());
            if let Some(content_type) = &file.content_type {
                part = part.mime_str(content_type)?;
            }
            form = form.part("files", part);
        }

        let response = self
            .client
            .post(self.endpoint(&["chats", id, "upload"]))
            .timeout(self.request_timeout())
            .multipart(form)
            .send()
            .await?;
        let response = check_status(response, &format!("session {id}")).await?;
        Ok(response.bytes().await?)
    }

    async fn delete_document(&self, id: &str, filename: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.endpoint(&["chats", id, "documents", filename]))
            .timeout(self.request_timeout())
            .send()
            .await?;
        check_status(response, &format!("document {filename}")).await?;
        Ok(())
    }

    async fn fetch_document(&self, id: &str, filename: &str) -> Result<Bytes> {
        let url = &self.endpoint(&["chats", id, "documents", filename]);
        let what = &format!("document {filename}");
        self.idempotent("fetch_document", move || async move {
            let response = self
                .client
                .get(url.clone())
                .timeout(self.request_timeout())
                .send()
                .await?;
            let response = check_status(response, what).await?;
            Ok(response.bytes().await?)
        })
        .await
    }
}

// ============================================================================
// TESTS
// ============================================================================
