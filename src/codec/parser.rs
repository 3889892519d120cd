//! Incremental event-stream parser
//!
//! The parser accumulates field lines until a blank line completes the
//! frame, then yields an [`InboundEvent`] and starts over. Bytes after the
//! last line terminator are carried over to the next [`EventParser::feed`].
//!
//! Malformed lines (invalid UTF-8, non-numeric `retry`, `id` with NUL) are
//! skipped individually; the rest of the frame still counts.

use std::time::Duration;

use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use crate::error::SseError;
use crate::types::InboundEvent;

const BOM: &[u8] = b"\xEF\xBB\xBF";

/// Where the parser is within the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// Collecting field lines of a frame
    AccumulatingFields,
    /// A blank line completed a frame that is waiting to be yielded
    EventReady,
}

/// Fields seen so far in the current frame
#[derive(Debug, Default)]
struct PendingFrame {
    id: Option<String>,
    name: Option<String>,
    comment: Option<String>,
    data: Vec<String>,
    retry: Option<Duration>,
}

impl PendingFrame {
    fn is_dispatchable(&self) -> bool {
        !self.data.is_empty() || self.comment.is_some() || self.name.is_some()
    }

    fn into_event(self) -> InboundEvent {
        InboundEvent {
            id: self.id,
            name: self.name,
            comment: self.comment,
            data: self.data.join("\n"),
            reconnect_delay: self.retry,
        }
    }
}

/// Streaming SSE parser; one instance per event source
#[derive(Debug)]
pub struct EventParser {
    buffer: BytesMut,
    /// Prefix of `buffer` already searched for a line terminator
    scanned: usize,
    frame: PendingFrame,
    state: ParserState,
    stream_started: bool,
    last_event_id: Option<String>,
    reconnect_delay: Option<Duration>,
    skipped_lines: u64,
}

impl Default for EventParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EventParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            scanned: 0,
            frame: PendingFrame::default(),
            state: ParserState::AccumulatingFields,
            stream_started: false,
            last_event_id: None,
            reconnect_delay: None,
            skipped_lines: 0,
        }
    }

    /// Append a chunk and lazily yield the events it completes
    pub fn feed(&mut self, chunk: impl AsRef<[u8]>) -> Events<'_> {
        self.buffer.extend_from_slice(chunk.as_ref());
        Events { parser: self }
    }

    /// Drop buffered partial input before a new connection
    ///
    /// `last_event_id` and the last `retry` value survive.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
        self.frame = PendingFrame::default();
        self.state = ParserState::AccumulatingFields;
        self.stream_started = false;
    }

    /// Most recent `id:` value seen on any connection
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Most recent valid `retry:` value seen on any connection
    pub fn reconnect_delay(&self) -> Option<Duration> {
        self.reconnect_delay
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Number of malformed lines skipped so far
    pub fn skipped_lines(&self) -> u64 {
        self.skipped_lines
    }

    /// Bytes of an incomplete trailing line
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn next_event(&mut self) -> Option<InboundEvent> {
        loop {
            if self.state == ParserState::EventReady {
                self.state = ParserState::AccumulatingFields;
                let frame = std::mem::take(&mut self.frame);
                return Some(frame.into_event());
            }

            let Some(offset) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n') else {
                self.scanned = self.buffer.len();
                return None;
            };
            let newline = self.scanned + offset;
            self.scanned = 0;
            let mut line = self.buffer.split_to(newline + 1);
            line.truncate(newline);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            if !self.stream_started {
                self.stream_started = true;
                if line.starts_with(BOM) {
                    line.advance(BOM.len());
                }
            }

            if line.is_empty() {
                if self.frame.is_dispatchable() {
                    self.state = ParserState::EventReady;
                } else {
                    // id/retry-only frames update state but are not events
                    self.frame = PendingFrame::default();
                }
                continue;
            }

            if let Err(err) = self.process_line(&line) {
                self.skipped_lines += 1;
                debug!(error = %err, "Skipping malformed event-stream line");
            }
        }
    }

    fn process_line(&mut self, line: &[u8]) -> Result<(), SseError> {
        let line = std::str::from_utf8(line)
            .map_err(|e| SseError::MalformedFrame(format!("invalid UTF-8: {}", e)))?;

        if let Some(comment) = line.strip_prefix(':') {
            let comment = strip_leading_space(comment);
            match &mut self.frame.comment {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(comment);
                }
                None => self.frame.comment = Some(comment.to_string()),
            }
            return Ok(());
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, strip_leading_space(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.frame.name = Some(value.to_string()),
            "data" => self.frame.data.push(value.to_string()),
            "id" => {
                if value.contains('\0') {
                    return Err(SseError::MalformedFrame("id contains NUL".to_string()));
                }
                self.frame.id = Some(value.to_string());
                self.last_event_id = Some(value.to_string());
            }
            "retry" => {
                let millis: u64 = value.parse().map_err(|_| {
                    SseError::MalformedFrame(format!("retry is not an integer: '{}'", value))
                })?;
                let delay = Duration::from_millis(millis);
                self.frame.retry = Some(delay);
                self.reconnect_delay = Some(delay);
            }
            other => trace!(field = other, "Ignoring unknown event-stream field"),
        }
        Ok(())
    }
}

fn strip_leading_space(value: &str) -> &str {
    value.strip_prefix(' ').unwrap_or(value)
}

/// Events completed by the bytes fed so far
pub struct Events<'a> {
    parser: &'a mut EventParser,
}

impl Iterator for Events<'_> {
    type Item = InboundEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.parser.next_event()
    }
}
