//! Line framing for the child's stdout.
//!
//! Chunks arrive with no alignment to message boundaries. The framer buffers
//! bytes, splits on `\n`, and classifies each complete line. Anything that is
//! not a protocol message (startup banners, log lines, half-written debug
//! output) is dropped with a debug log; it never reaches a pending call.

use std::collections::VecDeque;

use futures::stream::{self, Stream};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::errors::ProtocolError;
use super::types::Message;

/// Read buffer size for [`message_stream`].
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Incremental newline splitter and classifier.
#[derive(Debug, Default)]
pub struct MessageFramer {
    buffer: Vec<u8>,
}

impl MessageFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every message completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Message> {
        self.buffer.extend_from_slice(chunk);

        let mut messages = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(msg) = decode_line(&line) {
                messages.push(msg);
            }
        }
        messages
    }

    /// Convenience wrapper over [`push`](Self::push) for text chunks.
    pub fn push_str(&mut self, chunk: &str) -> Vec<Message> {
        self.push(chunk.as_bytes())
    }

    /// Flush a trailing line that was never newline-terminated (end of stream).
    pub fn finish(&mut self) -> Option<Message> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        decode_line(&line)
    }

    /// Bytes buffered but not yet terminated by a newline.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_line(raw: &[u8]) -> Option<Message> {
    let text = String::from_utf8_lossy(raw);
    match parse_line(&text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(
                target: "toolbridge::framer",
                error = %e,
                line = %text.trim(),
                "discarding non-protocol line"
            );
            None
        }
    }
}

/// Classify a single line.
///
/// `Ok(None)` means the line was blank or obviously not JSON (does not start
/// with `{`), which is the common case for log noise and not worth an error.
pub fn parse_line(line: &str) -> Result<Option<Message>, ProtocolError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if !trimmed.starts_with('{') {
        tracing::debug!(target: "toolbridge::framer", line = trimmed, "child output");
        return Ok(None);
    }

    let value: serde_json::Value = serde_json::from_str(trimmed)?;
    Message::from_value(value).map(Some)
}

/// Turn a byte stream into a lazy, unbounded stream of messages.
///
/// The stream ends when the reader reaches EOF or fails; a final unterminated
/// line is still classified before the stream closes.
pub fn message_stream<R>(reader: R) -> impl Stream<Item = Message>
where
    R: AsyncRead + Unpin,
{
    struct State<R> {
        reader: R,
        chunk: Vec<u8>,
        framer: MessageFramer,
        ready: VecDeque<Message>,
        done: bool,
    }

    let state = State {
        reader,
        chunk: vec![0u8; READ_CHUNK_SIZE],
        framer: MessageFramer::new(),
        ready: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(msg) = st.ready.pop_front() {
                return Some((msg, st));
            }
            if st.done {
                return None;
            }

            match st.reader.read(&mut st.chunk).await {
                Ok(0) => {
                    st.done = true;
                    st.ready.extend(st.framer.finish());
                }
                Ok(n) => {
                    st.ready.extend(st.framer.push(&st.chunk[..n]));
                }
                Err(e) => {
                    tracing::warn!(target: "toolbridge::framer", error = %e, "read from child failed");
                    st.done = true;
                    st.ready.extend(st.framer.finish());
                }
            }
        }
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
