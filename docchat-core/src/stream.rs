//! Streamed reply decoding.
//!
//! The message endpoint answers with records separated by a blank line:
//!
//! ```text
//! data: {"token":"He"}
//!
//! data: {"token":"llo"}
//!
//! data: [DONE]
//! ```
//!
//! `RecordCodec` frames and validates records out of a byte buffer;
//! `ReplyDecoder` drives it over the transport's chunk stream. Records are
//! split on bytes, so a chunk boundary may fall anywhere, including inside a
//! multi-byte character.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio_util::codec::Decoder;

use crate::error::{ChatError, Result};

pub const DONE_SENTINEL: &str = "[DONE]";

/// One validated record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRecord {
    Token(String),
    Done,
    Malformed { payload: String, reason: String },
}

#[derive(Debug, Deserialize)]
struct TokenPayload {
    token: String,
}

/// How a reply ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// `[DONE]` was received.
    Confirmed,
    /// The transport ended without `[DONE]`.
    Unconfirmed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyEvent {
    Token(String),
    Finished(Completion),
}

// ============================================================================
// RecordCodec
// ============================================================================

#[derive(Debug, Default, Clone)]
pub struct RecordCodec {
    /// Bytes at the front of the buffer already known not to start a separator.
    scanned: usize,
}

impl RecordCodec {
    pub fn reset(&mut self) {
        self.scanned = 0;
    }
}

impl Decoder for RecordCodec {
    type Item = StreamRecord;
    type Error = ChatError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<StreamRecord>> {
        while let Some((end, separator)) = find_boundary(src, self.scanned) {
            let raw = src.split_to(end + separator);
            self.scanned = 0;
            if let Some(record) = parse_record(&raw[..end]) {
                return Ok(Some(record));
            }
        }
        // A separator may still begin in the last three bytes.
        self.scanned = src.len().saturating_sub(3);
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<StreamRecord>> {
        if let Some(record) = self.decode(src)? {
            return Ok(Some(record));
        }
        if src.is_empty() {
            return Ok(None);
        }
        // Final record without a trailing blank line.
        self.scanned = 0;
        let raw = src.split();
        Ok(parse_record(&raw))
    }
}

/// Position and length of the first record separator (`\n\n` or `\r\n\r\n`)
/// at or after `from`.
fn find_boundary(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    (from.min(buf.len())..buf.len()).find_map(|i| {
        let rest = &buf[i..];
        if rest.starts_with(b"\n\n") {
            Some((i, 2))
        } else if rest.starts_with(b"\r\n\r\n") {
            Some((i, 4))
        } else {
            None
        }
    })
}

/// `None` for records without a `data:` line (comments, keep-alives).
fn parse_record(raw: &[u8]) -> Option<StreamRecord> {
    let text = match std::str::from_utf8(raw) {
        Ok(t) => t,
        Err(e) => {
            return Some(StreamRecord::Malformed {
                payload: String::from_utf8_lossy(raw).into_owned(),
                reason: e.to_string(),
            })
        }
    };

    let mut data: Option<String> = None;
    for line in text.lines() {
        let Some(value) = line.strip_prefix("data:") else {
            continue;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        match data.as_mut() {
            Some(d) => {
                d.push('\n');
                d.push_str(value);
            }
            None => data = Some(value.to_string()),
        }
    }

    data.map(|payload| classify_payload(&payload))
}

fn classify_payload(payload: &str) -> StreamRecord {
    let trimmed = payload.trim();
    if trimmed == DONE_SENTINEL {
        return StreamRecord::Done;
    }
    match serde_json::from_str::<TokenPayload>(trimmed) {
        Ok(p) => StreamRecord::Token(p.token),
        Err(e) => StreamRecord::Malformed {
            payload: payload.to_string(),
            reason: e.to_string(),
        },
    }
}

// ============================================================================
// ReplyDecoder
// ============================================================================

/// Incremental decoder over a reply's chunk stream.
pub struct ReplyDecoder<S> {
    chunks: S,
    codec: RecordCodec,
    buffer: BytesMut,
    eof: bool,
    finished: Option<Completion>,
    malformed: usize,
}

impl<S> ReplyDecoder<S>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    pub fn new(chunks: S) -> Self {
        Self {
            chunks,
            codec: RecordCodec::default(),
            buffer: BytesMut::new(),
            eof: false,
            finished: None,
            malformed: 0,
        }
    }

    /// Next token, or the completion once the reply is over. Keeps returning
    /// the completion after that; records following `[DONE]` are never read.
    pub async fn next_event(&mut self) -> Result<ReplyEvent> {
        loop {
            if let Some(completion) = self.finished {
                return Ok(ReplyEvent::Finished(completion));
            }

            let decoded = if self.eof {
                self.codec.decode_eof(&mut self.buffer)?
            } else {
                self.codec.decode(&mut self.buffer)?
            };

            match decoded {
                Some(StreamRecord::Token(token)) => return Ok(ReplyEvent::Token(token)),
                Some(StreamRecord::Done) => {
                    self.buffer.clear();
                    self.codec.reset();
                    self.finished = Some(Completion::Confirmed);
                    continue;
                }
                Some(StreamRecord::Malformed { payload, reason }) => {
                    self.malformed += 1;
                    tracing::warn!(payload = %payload, reason = %reason, "Skipping malformed stream record");
                    continue;
                }
                None if self.eof => {
                    tracing::debug!("Reply stream ended without [DONE]");
                    self.finished = Some(Completion::Unconfirmed);
                    continue;
                }
                None => {}
            }

            match self.chunks.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(e),
                None => self.eof = true,
            }
        }
    }

    /// Records skipped so far because they failed validation.
    pub fn malformed_count(&self) -> usize {
        self.malformed
    }
}

// ============================================================================
// TESTS
// ============================================================================
