//! Document upload.
//!
//! All files go out in one multipart request. Without an active session the
//! request targets the `new` sentinel and the server reports the session it
//! created in the reply. Every submitted file comes back classified as
//! uploaded, skipped (duplicate filename) or failed. A success reply that
//! does not account for every file leaves the rest unconfirmed, to be
//! settled from the re-fetched session. Only an empty batch is an error.

use std::sync::Arc;

use crate::api::ChatApi;
use crate::error::{ChatError, Result};
use crate::models::{UploadFile, UploadOutcome, UploadReply};

/// Path id asking the server to create a session for the upload.
pub const NEW_SESSION: &str = "new";

#[derive(Clone)]
pub struct UploadCoordinator {
    api: Arc<dyn ChatApi>,
}

impl UploadCoordinator {
    pub fn new(api: Arc<dyn ChatApi>) -> Self {
        Self { api }
    }

    /// Upload `files` into `session` (or a new session when `None`).
    ///
    /// `progress` receives human-readable status before the request and the
    /// summary once the outcome is known.
    pub async fn upload<P>(
        &self,
        session: Option<&str>,
        files: &[UploadFile],
        mut progress: P,
    ) -> Result<UploadOutcome>
    where
        P: FnMut(&str),
    {
        if files.is_empty() {
            return Err(ChatError::InvalidInput("no files to upload".to_string()));
        }
        let names: Vec<String> = files.iter().map(|f| f.filename.clone()).collect();
        let target = session.unwrap_or(NEW_SESSION);

        match names.as_slice() {
            [single] => progress(&format!("Uploading {single}...")),
            _ => progress(&format!("Uploading {} files...", names.len())),
        }

        let outcome = match self.api.upload(target, files).await {
            Ok(body) => match UploadReply::parse(&body) {
                UploadReply::Summary(summary) => UploadOutcome::classify(&names, summary, session),
                UploadReply::Malformed(reason) => {
                    tracing::warn!(session_id = %target, reason = %reason, "Unreadable upload reply");
                    UploadOutcome::unverified(
                        &names,
                        session,
                        format!("unreadable upload reply: {reason}"),
                    )
                }
            },
            Err(e) => {
                tracing::warn!(session_id = %target, error = %e, "Upload request failed");
                UploadOutcome::batch_failed(&names, session, e.to_string())
            }
        };

        if outcome.may_have_stored() && outcome.session_id.is_none() {
            tracing::warn!("Upload reply did not name the session it created");
        }

        tracing::info!(
            session_id = outcome.session_id.as_deref().unwrap_or("-"),
            uploaded = outcome.uploaded_count(),
            skipped = outcome.skipped_count(),
            failed = outcome.failed_count(),
            unconfirmed = outcome.unconfirmed.len(),
            "Upload finished"
        );
        progress(&outcome.summary_line());
        Ok(outcome)
    }
}
