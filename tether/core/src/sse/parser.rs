//! Incremental SSE parser.
//!
//! Text or bytes go in through [`EventParser::feed`] / [`EventParser::feed_bytes`];
//! complete events come out synchronously on an unbounded channel. The parser
//! never fails: malformed lines are dropped, an over-long line resets only the
//! working buffer, and an incomplete UTF-8 sequence at the end of a chunk is
//! held back until the rest of it arrives.
//!
//! A heartbeat watchdog (optional, needs a tokio runtime) reports a silent
//! connection on a separate channel without closing anything.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::event::{StreamEvent, DONE_SENTINEL};

/// Where dispatched events go
pub type EventSink = mpsc::UnboundedSender<StreamEvent>;

/// Parser configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParserConfig {
    /// Silence after which a stale-connection notice fires
    pub heartbeat_timeout: Duration,
    /// Largest pending line kept while waiting for a newline
    pub max_line_bytes: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(45),
            max_line_bytes: 1024 * 1024,
        }
    }
}

/// Stale-connection notice from the heartbeat watchdog
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaleConnection {
    /// Resumption cursor at the time the connection went quiet
    pub last_event_id: Option<String>,
    /// How long nothing arrived
    pub idle_for: Duration,
}

/// Counters for diagnostics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParserStats {
    /// Events pushed to the sink
    pub events_emitted: u64,
    /// Comment / keep-alive lines
    pub comments_seen: u64,
    /// Lines without a field separator, and invalid byte runs
    pub lines_dropped: u64,
    /// Times the working buffer was discarded
    pub chunks_reset: u64,
}

/// Stateful SSE text-to-event converter
pub struct EventParser {
    config: ParserConfig,
    sink: Option<EventSink>,
    /// Text not yet terminated by a newline
    line_buffer: String,
    /// Undecoded tail of the last byte chunk (an incomplete UTF-8 sequence)
    pending_bytes: Vec<u8>,
    event_type: Option<String>,
    data: String,
    data_lines: usize,
    id: Option<String>,
    retry: Option<u64>,
    last_event_id: Option<String>,
    done: bool,
    stats: ParserStats,
    heartbeat: Option<Heartbeat>,
}

impl EventParser {
    /// Create a parser without a heartbeat watchdog
    #[must_use]
    pub fn new(config: ParserConfig, sink: EventSink) -> Self {
        Self {
            config,
            sink: Some(sink),
            line_buffer: String::new(),
            pending_bytes: Vec::new(),
            event_type: None,
            data: String::new(),
            data_lines: 0,
            id: None,
            retry: None,
            last_event_id: None,
            done: false,
            stats: ParserStats::default(),
            heartbeat: None,
        }
    }

    /// Create a parser with an armed heartbeat watchdog
    ///
    /// Must be called within a tokio runtime. The receiver yields one
    /// [`StaleConnection`] per silent period.
    #[must_use]
    pub fn with_heartbeat(
        config: ParserConfig,
        sink: EventSink,
    ) -> (Self, mpsc::UnboundedReceiver<StaleConnection>) {
        let (stale_tx, stale_rx) = mpsc::unbounded_channel();
        let heartbeat = Heartbeat::start(config.heartbeat_timeout, stale_tx);
        let mut parser = Self::new(config, sink);
        parser.heartbeat = Some(heartbeat);
        (parser, stale_rx)
    }

    /// Last `id:` seen, for reconnecting with `Last-Event-ID`
    #[must_use]
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Seed the resumption cursor (used when reconnecting a stream)
    pub fn set_last_event_id(&mut self, id: Option<String>) {
        self.id.clone_from(&id);
        self.last_event_id.clone_from(&id);
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.set_cursor(id);
        }
    }

    /// Whether the `[DONE]` sentinel has been seen
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Whether the sink has been closed (by `[DONE]` or [`close`](Self::close))
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sink.is_none()
    }

    /// Parser counters
    #[must_use]
    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    /// Feed a chunk of text
    pub fn feed(&mut self, chunk: &str) {
        if self.is_closed() {
            tracing::trace!(len = chunk.len(), "Ignoring input after close");
            return;
        }
        self.touch();
        self.line_buffer.push_str(chunk);
        self.process_buffer();
    }

    /// Feed raw bytes from a transport
    ///
    /// A multi-byte character split across chunks is kept back until it is
    /// complete. Invalid byte sequences are dropped.
    pub fn feed_bytes(&mut self, chunk: &[u8]) {
        if self.is_closed() {
            tracing::trace!(len = chunk.len(), "Ignoring input after close");
            return;
        }
        self.touch();
        self.pending_bytes.extend_from_slice(chunk);

        let mut text = String::with_capacity(self.pending_bytes.len());
        let mut rest: &[u8] = &self.pending_bytes;
        let mut dropped = 0usize;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, tail) = rest.split_at(err.valid_up_to());
                    text.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match err.error_len() {
                        Some(bad) => {
                            dropped += bad;
                            rest = &tail[bad..];
                        }
                        None => {
                            rest = tail;
                            break;
                        }
                    }
                }
            }
        }
        let remainder = rest.to_vec();
        self.pending_bytes = remainder;

        if dropped > 0 {
            self.stats.lines_dropped += 1;
            tracing::debug!(bytes = dropped, "Dropped invalid UTF-8 in stream");
        }

        self.line_buffer.push_str(&text);
        self.process_buffer();
    }

    /// Flush any pending event and close the sink
    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        if !self.pending_bytes.is_empty() {
            tracing::debug!(
                bytes = self.pending_bytes.len(),
                "Discarding incomplete character at close"
            );
            self.pending_bytes.clear();
        }

        let tail = std::mem::take(&mut self.line_buffer);
        let tail = tail.strip_suffix('\r').unwrap_or(&tail);
        if !tail.is_empty() {
            self.process_line(tail);
        }
        if !self.done {
            self.dispatch();
        }
        self.shutdown();
    }

    fn touch(&self) {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.touch();
        }
    }

    fn process_buffer(&mut self) {
        let buffer = std::mem::take(&mut self.line_buffer);
        let mut start = 0;

        while let Some(offset) = buffer[start..].find(['\n', '\r']) {
            let end = start + offset;
            let next = if buffer.as_bytes()[end] == b'\r' {
                match buffer.as_bytes().get(end + 1) {
                    Some(b'\n') => end + 2,
                    Some(_) => end + 1,
                    // a trailing CR may be the first half of CRLF
                    None => break,
                }
            } else {
                end + 1
            };

            self.process_line(&buffer[start..end]);
            start = next;
            if self.done {
                return;
            }
        }

        let remainder = &buffer[start..];
        if remainder.len() > self.config.max_line_bytes {
            self.stats.chunks_reset += 1;
            tracing::warn!(
                pending = remainder.len(),
                limit = self.config.max_line_bytes,
                "Line exceeded buffer limit, resetting working buffer"
            );
            self.data.clear();
            self.data_lines = 0;
            self.event_type = None;
            return;
        }
        self.line_buffer = remainder.to_string();
    }

    fn process_line(&mut self, line: &str) {
        if line.is_empty() {
            self.dispatch();
            return;
        }

        if let Some(comment) = line.strip_prefix(':') {
            self.stats.comments_seen += 1;
            let comment = comment.trim();
            if !comment.is_empty() {
                tracing::trace!(comment, "SSE comment");
            }
            return;
        }

        let Some((field, value)) = line.split_once(':') else {
            self.stats.lines_dropped += 1;
            tracing::debug!(len = line.len(), "Dropping SSE line without field separator");
            return;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);

        match field {
            "data" => {
                if value == DONE_SENTINEL {
                    self.dispatch();
                    self.done = true;
                    tracing::debug!("Stream completion sentinel received");
                    self.shutdown();
                    return;
                }
                if self.data_lines > 0 {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.data_lines += 1;
            }
            "event" => self.event_type = Some(value.to_string()),
            "id" => {
                if value.contains('\0') {
                    return;
                }
                self.id = Some(value.to_string());
                self.last_event_id = Some(value.to_string());
                if let Some(heartbeat) = &self.heartbeat {
                    heartbeat.set_cursor(self.last_event_id.clone());
                }
            }
            "retry" => {
                if let Ok(ms) = value.trim().parse::<u64>() {
                    self.retry = Some(ms);
                }
            }
            _ => {}
        }
    }

    fn dispatch(&mut self) {
        if self.data.is_empty() {
            return;
        }
        let event = StreamEvent {
            id: self.id.clone(),
            event_type: self.event_type.take(),
            data: std::mem::take(&mut self.data),
            retry: self.retry,
        };
        self.data_lines = 0;

        if let Some(sink) = &self.sink {
            if sink.send(event).is_ok() {
                self.stats.events_emitted += 1;
            } else {
                tracing::debug!("Event receiver dropped, closing parser");
                self.sink = None;
            }
        }
    }

    fn shutdown(&mut self) {
        self.sink = None;
        self.line_buffer.clear();
        self.pending_bytes.clear();
        self.heartbeat = None;
    }
}

impl std::fmt::Debug for EventParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventParser")
            .field("last_event_id", &self.last_event_id)
            .field("done", &self.done)
            .field("closed", &self.is_closed())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

struct HeartbeatState {
    last_activity: Instant,
    notified: bool,
    cursor: Option<String>,
}

/// Watchdog task that fires once per silent period
struct Heartbeat {
    state: Arc<Mutex<HeartbeatState>>,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl Heartbeat {
    fn start(timeout: Duration, tx: mpsc::UnboundedSender<StaleConnection>) -> Self {
        let state = Arc::new(Mutex::new(HeartbeatState {
            last_activity: Instant::now(),
            notified: false,
            cursor: None,
        }));
        let wake = Arc::new(Notify::new());

        let task = tokio::spawn({
            let state = Arc::clone(&state);
            let wake = Arc::clone(&wake);
            async move {
                loop {
                    let (deadline, notified) = {
                        let s = state.lock();
                        (s.last_activity + timeout, s.notified)
                    };
                    if notified {
                        wake.notified().await;
                        continue;
                    }
                    tokio::time::sleep_until(deadline).await;

                    let notice = {
                        let mut s = state.lock();
                        let idle_for = s.last_activity.elapsed();
                        if s.notified || idle_for < timeout {
                            None
                        } else {
                            s.notified = true;
                            Some(StaleConnection {
                                last_event_id: s.cursor.clone(),
                                idle_for,
                            })
                        }
                    };
                    if let Some(notice) = notice {
                        tracing::debug!(idle = ?notice.idle_for, "Stream heartbeat expired");
                        if tx.send(notice).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self { state, wake, task }
    }

    fn touch(&self) {
        let rearm = {
            let mut s = self.state.lock();
            s.last_activity = Instant::now();
            std::mem::replace(&mut s.notified, false)
        };
        if rearm {
            self.wake.notify_one();
        }
    }

    fn set_cursor(&self, cursor: Option<String>) {
        self.state.lock().cursor = cursor;
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.task.abort();
    }
}
