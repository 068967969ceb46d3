use std::collections::HashMap;
use std::path::Path;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::DocumentMetadata;
use crate::error::{ChatError, Result};

/// One file queued for upload.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

impl UploadFile {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        let filename = filename.into();
        Self {
            content_type: guess_content_type(&filename).map(str::to_string),
            filename,
            bytes: bytes.into(),
        }
    }

    /// Read a file from disk; the upload filename is the final path component.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ChatError::InvalidInput(format!("not a file path: {}", path.display())))?
            .to_string();
        let bytes = tokio::fs::read(path).await?;
        Ok(Self::new(filename, bytes))
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

fn guess_content_type(filename: &str) -> Option<&'static str> {
    let ext = filename.rsplit_once('.')?.1.to_ascii_lowercase();
    match ext.as_str() {
        "pdf" => Some("application/pdf"),
        "txt" => Some("text/plain"),
        "md" => Some("text/markdown"),
        "csv" => Some("text/csv"),
        "json" => Some("application/json"),
        "docx" => Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
        _ => None,
    }
}

/// Wire body of `POST /chats/:id/upload`.
///
/// Every field is optional: older servers answer with `uploaded_count` alone
/// and never list skipped files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadSummary {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub uploaded_count: u32,
    #[serde(default)]
    pub skipped_count: u32,
    #[serde(default)]
    pub failed_count: u32,
    #[serde(default)]
    pub skipped_files: Vec<String>,
    #[serde(default)]
    pub failed_files: Vec<String>,
}

/// Body of an upload reply that came back with a success status.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadReply {
    Summary(UploadSummary),
    /// Not the JSON object we expect. The server still took the request.
    Malformed(String),
}

impl UploadReply {
    pub fn parse(body: &[u8]) -> Self {
        match serde_json::from_slice(body) {
            Ok(summary) => UploadReply::Summary(summary),
            Err(e) => UploadReply::Malformed(e.to_string()),
        }
    }
}

/// Per-file classification of one upload batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadOutcome {
    /// Session the files landed in. Differs from the requested id when the
    /// server created the session.
    pub session_id: Option<String>,
    pub uploaded: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
    /// Taken by the server but not accounted for by its reply. Settled
    /// against the session's document list once it is re-fetched.
    pub unconfirmed: Vec<String>,
    /// The server answered with a success status, so it may have stored files.
    pub accepted: bool,
    /// Batch-level problem (transport, status, unreadable reply).
    pub error: Option<String>,
}

impl UploadOutcome {
    /// Classify every submitted filename exactly once from a success reply.
    ///
    /// Files the reply names as skipped or failed go there. The rest are
    /// uploaded when `uploaded_count` accounts for exactly them, and
    /// unconfirmed otherwise.
    pub fn classify(
        submitted: &[String],
        summary: UploadSummary,
        requested_session: Option<&str>,
    ) -> Self {
        let mut pending_skips = multiset(&summary.skipped_files);
        let mut pending_failures = multiset(&summary.failed_files);
        let mut outcome = UploadOutcome {
            session_id: summary
                .session_id
                .or_else(|| requested_session.map(str::to_string)),
            accepted: true,
            ..Default::default()
        };

        let mut rest = Vec::new();
        for name in submitted {
            if take(&mut pending_skips, name) {
                outcome.skipped.push(name.clone());
            } else if take(&mut pending_failures, name) {
                outcome.failed.push(name.clone());
            } else {
                rest.push(name.clone());
            }
        }

        let stray = pending_skips.values().chain(pending_failures.values()).sum::<usize>();
        if stray > 0 {
            tracing::warn!(stray, "Upload reply names files that were not submitted");
        }
        if rest.len() == summary.uploaded_count as usize {
            outcome.uploaded = rest;
        } else {
            tracing::debug!(
                remaining = rest.len(),
                uploaded_count = summary.uploaded_count,
                "Upload reply does not account for every file"
            );
            outcome.unconfirmed = rest;
        }
        outcome
    }

    /// Success status with a body we could not read: nothing is known per file.
    pub fn unverified(
        submitted: &[String],
        requested_session: Option<&str>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            session_id: requested_session.map(str::to_string),
            unconfirmed: submitted.to_vec(),
            accepted: true,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Whole batch failed before the server classified anything.
    pub fn batch_failed(
        submitted: &[String],
        requested_session: Option<&str>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            session_id: requested_session.map(str::to_string),
            failed: submitted.to_vec(),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Resolve unconfirmed files from the session's documents before and
    /// after the upload: present before means a duplicate, new afterwards
    /// means uploaded, missing means failed.
    pub fn settle(&mut self, before: &[DocumentMetadata], after: &[DocumentMetadata]) {
        let listed = |docs: &[DocumentMetadata], name: &str| docs.iter().any(|d| d.filename == name);
        for name in std::mem::take(&mut self.unconfirmed) {
            if listed(before, &name) {
                self.skipped.push(name);
            } else if listed(after, &name) {
                self.uploaded.push(name);
            } else {
                self.failed.push(name);
            }
        }
    }

    pub fn uploaded_count(&self) -> usize {
        self.uploaded.len()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn has_uploads(&self) -> bool {
        !self.uploaded.is_empty()
    }

    /// The server may hold new files from this batch.
    pub fn may_have_stored(&self) -> bool {
        self.accepted && (self.has_uploads() || !self.unconfirmed.is_empty())
    }

    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty()
            && self.failed.is_empty()
            && self.unconfirmed.is_empty()
            && self.error.is_none()
    }

    /// Human-readable one-line summary for the user.
    pub fn summary_line(&self) -> String {
        let mut line = format!("Uploaded {} file(s)", self.uploaded_count());
        if !self.skipped.is_empty() {
            line.push_str(&format!(
                ", skipped {} duplicate(s): {}",
                self.skipped_count(),
                self.skipped.join(", ")
            ));
        }
        if !self.failed.is_empty() {
            line.push_str(&format!(
                ", {} failed: {}",
                self.failed_count(),
                self.failed.join(", ")
            ));
        }
        if !self.unconfirmed.is_empty() {
            line.push_str(&format!(
                ", {} unconfirmed: {}",
                self.unconfirmed.len(),
                self.unconfirmed.join(", ")
            ));
        }
        if let Some(error) = &self.error {
            line.push_str(&format!(" ({error})"));
        }
        line
    }
}

fn multiset(names: &[String]) -> HashMap<&str, usize> {
    let mut counts = HashMap::new();
    for name in names {
        *counts.entry(name.as_str()).or_insert(0) += 1;
    }
    counts
}

fn take(counts: &mut HashMap<&str, usize>, name: &str) -> bool {
    match counts.get_mut(name) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn doc(name: &str) -> DocumentMetadata {
        DocumentMetadata {
            filename: name.to_string(),
            size: 1,
            uploaded_at: Utc::now(),
            content_type: None,
            is_deleted: false,
        }
    }

    fn summary(body: &str) -> UploadSummary {
        match UploadReply::parse(body.as_bytes()) {
            UploadReply::Summary(summary) => summary,
            UploadReply::Malformed(reason) => panic!("unexpected malformed reply: {reason}"),
        }
    }

    #[test]
    fn test_reply_with_duplicate_is_classified_as_skipped() {
        let submitted = names(&["a.pdf", "b.pdf", "c.pdf"]);
        let body = serde_json::json!({
            "session_id": "s1",
            "uploaded_count": 2,
            "skipped_count": 1,
            "failed_count": 0,
            "skipped_files": ["b.pdf"],
            "failed_files": []
        })
        .to_string();

        let outcome = UploadOutcome::classify(&submitted, summary(&body), Some("s1"));

        assert_eq!(outcome.uploaded, names(&["a.pdf", "c.pdf"]));
        assert_eq!(outcome.skipped, names(&["b.pdf"]));
        assert_eq!(outcome.failed_count(), 0);
        assert!(outcome.unconfirmed.is_empty());
        assert!(outcome.accepted);
        assert_eq!(outcome.session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_count_only_reply_leaves_files_unconfirmed() {
        let submitted = names(&["a.pdf", "b.pdf", "c.pdf"]);
        let outcome = UploadOutcome::classify(
            &submitted,
            summary(r#"{"uploaded_count":2,"total_chunks_ingested":7}"#),
            Some("s1"),
        );

        assert!(outcome.accepted);
        assert!(outcome.failed.is_empty());
        assert!(outcome.uploaded.is_empty());
        assert_eq!(outcome.unconfirmed, submitted);
        assert_eq!(outcome.session_id.as_deref(), Some("s1"));
        assert!(outcome.may_have_stored());
        assert!(!outcome.is_clean());
    }

    #[test]
    fn test_settle_against_document_lists() {
        let submitted = names(&["a.pdf", "b.pdf", "c.pdf"]);
        let mut outcome = UploadOutcome::classify(
            &submitted,
            summary(r#"{"uploaded_count":1}"#),
            Some("s1"),
        );

        outcome.settle(&[doc("b.pdf")], &[doc("b.pdf"), doc("a.pdf")]);

        assert_eq!(outcome.uploaded, names(&["a.pdf"]));
        assert_eq!(outcome.skipped, names(&["b.pdf"]));
        assert_eq!(outcome.failed, names(&["c.pdf"]));
        assert!(outcome.unconfirmed.is_empty());
    }

    #[test]
    fn test_reply_naming_unknown_file_still_classifies_batch() {
        let submitted = names(&["a.pdf"]);
        let outcome = UploadOutcome::classify(
            &submitted,
            summary(r#"{"uploaded_count":1,"failed_count":1,"failed_files":["zzz.pdf"]}"#),
            None,
        );
        assert_eq!(outcome.uploaded, submitted);
        assert!(outcome.failed.is_empty());
    }

    #[test]
    fn test_non_json_reply_is_malformed() {
        assert!(matches!(
            UploadReply::parse(b"<html>oops</html>"),
            UploadReply::Malformed(_)
        ));
        let outcome = UploadOutcome::unverified(&names(&["a.pdf"]), Some("s1"), "bad body");
        assert!(outcome.may_have_stored());
        assert!(outcome.failed.is_empty());
    }

    #[test]
    fn test_server_assigned_session_wins_over_requested() {
        let submitted = names(&["a.pdf"]);
        let summary = UploadSummary {
            session_id: Some("fresh".to_string()),
            uploaded_count: 1,
            ..Default::default()
        };
        let outcome = UploadOutcome::classify(&submitted, summary, None);
        assert_eq!(outcome.session_id.as_deref(), Some("fresh"));
        assert!(outcome.has_uploads());
        assert!(outcome.is_clean());
    }

    #[test]
    fn test_batch_failure_marks_every_file_failed() {
        let submitted = names(&["a.pdf", "b.pdf"]);
        let outcome = UploadOutcome::batch_failed(&submitted, Some("s1"), "connection refused");
        assert_eq!(outcome.failed, submitted);
        assert!(!outcome.accepted);
        assert!(!outcome.may_have_stored());
        assert!(outcome.summary_line().contains("connection refused"));
    }

    #[test]
    fn test_content_type_guess() {
        assert_eq!(
            UploadFile::new("Report.PDF", Bytes::from_static(b"%PDF")).content_type.as_deref(),
            Some("application/pdf")
        );
        assert!(UploadFile::new("blob", Bytes::new()).content_type.is_none());
    }
}
