//! Stream Client
//!
//! Facade used by the orchestration layer. A push stream flows
//!
//! ```text
//!   transport bytes ──► EventParser ──► decode_payload ──► TextChunk::Delta
//!                           │                   │
//!                     stale notice       registry progress
//!                           ▼
//!                 SessionRegistry::report_failure ──► recovery (reconnect
//!                                                     with Last-Event-ID)
//! ```
//!
//! Background jobs go through [`DeltaPoller`] instead and are not tracked by
//! the registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::chunk::TextChunk;
use crate::error::TetherError;
use crate::ids::{MessageId, StreamId};
use crate::poller::{DeltaPoller, PollerConfig, PollingEndpoint};
use crate::recovery::StreamMetadata;
use crate::registry::{
    ProgressUpdate, RecoveryCallback, RecoveryContext, SessionRegistry, StreamNotice,
    SubscriptionSlot,
};
use crate::sse::{decode_payload, EventParser, ParserConfig, Payload, StreamEvent};
use crate::transport::{ByteStream, PushRequest, StreamTransport};

/// Client configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Parser settings for push streams
    pub parser: ParserConfig,
    /// Poller settings for background jobs
    pub poller: PollerConfig,
    /// Chunks buffered per consumer before the reader waits
    pub chunk_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            parser: ParserConfig::default(),
            poller: PollerConfig::default(),
            chunk_buffer: 64,
        }
    }
}

/// Entry point for opening and cancelling reply streams
#[derive(Clone)]
pub struct StreamClient {
    transport: Arc<dyn StreamTransport>,
    endpoint: Arc<dyn PollingEndpoint>,
    registry: SessionRegistry,
    config: ClientConfig,
}

impl StreamClient {
    /// Create a client
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        endpoint: Arc<dyn PollingEndpoint>,
        registry: SessionRegistry,
        config: ClientConfig,
    ) -> Self {
        Self {
            transport,
            endpoint,
            registry,
            config,
        }
    }

    /// The registry tracking push streams
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Open a push stream and register it for recovery
    ///
    /// The receiver yields deltas in transport order and ends with exactly
    /// one [`TextChunk::Finished`] or [`TextChunk::Failed`]. Transient drops
    /// are recovered silently.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the initial connection fails; nothing
    /// is registered in that case.
    pub async fn open_push_stream(
        &self,
        request: PushRequest,
        metadata: StreamMetadata,
    ) -> Result<(mpsc::Receiver<TextChunk>, StreamId), TetherError> {
        let bytes = self.transport.open(&request).await?;

        let (chunk_tx, chunk_rx) = mpsc::channel(self.config.chunk_buffer.max(1));
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let slot = SubscriptionSlot::new();

        let session = Arc::new(PushSession {
            transport: Arc::clone(&self.transport),
            request,
            parser: self.config.parser.clone(),
            registry: self.registry.clone(),
            slot: slot.clone(),
            chunks: Mutex::new(Some(chunk_tx)),
            stream_id: OnceLock::new(),
            cursor: Mutex::new(Cursor::default()),
            delivered: Mutex::new(String::new()),
            sequence: AtomicU64::new(0),
        });

        let id = self.registry.register(
            Box::new(slot),
            notice_tx,
            Arc::new(PushRecovery(Arc::clone(&session))),
            metadata,
        );
        let _ = session.stream_id.set(id);

        tokio::spawn(forward_notices(Arc::clone(&session), notice_rx));
        session.start_reader(id, bytes);

        Ok((chunk_rx, id))
    }

    /// Reconstruct a background job's reply by polling
    ///
    /// The receiver ends with one terminal chunk; a timeout is reported as
    /// `Finished` with reason `"timeout"`.
    pub fn open_polling_fallback(
        &self,
        resource_id: impl Into<String>,
        message_id: MessageId,
    ) -> mpsc::Receiver<TextChunk> {
        let (tx, rx) = mpsc::channel(self.config.chunk_buffer.max(1));
        let poller = DeltaPoller::new(Arc::clone(&self.endpoint), self.config.poller.clone());
        let resource_id = resource_id.into();

        tokio::spawn(async move {
            match poller.poll(&resource_id, message_id.as_str(), tx).await {
                Ok(outcome) => tracing::debug!(resource_id = %resource_id, outcome = ?outcome, "Polling fallback ended"),
                Err(e) => tracing::debug!(resource_id = %resource_id, error = %e, "Polling fallback failed"),
            }
        });
        rx
    }

    /// Stop a push stream
    ///
    /// The consumer's receiver closes without a terminal chunk. Returns
    /// `false` for an unknown or already finished stream.
    pub async fn cancel(&self, id: StreamId) -> bool {
        self.registry.unregister(id).await
    }
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Resumption bookkeeping shared across reconnects
#[derive(Debug, Default)]
struct Cursor {
    /// Id to send as `Last-Event-ID`
    last_event_id: Option<String>,
    /// Highest numeric id applied so far
    last_applied: Option<u64>,
}

/// State of one push stream, shared by its reader, notice forwarder and
/// recovery callback
struct PushSession {
    transport: Arc<dyn StreamTransport>,
    request: PushRequest,
    parser: ParserConfig,
    registry: SessionRegistry,
    slot: SubscriptionSlot,
    /// Taken when the terminal chunk is sent, which closes the consumer side
    chunks: Mutex<Option<mpsc::Sender<TextChunk>>>,
    stream_id: OnceLock<StreamId>,
    cursor: Mutex<Cursor>,
    /// Text the consumer has been given so far
    delivered: Mutex<String>,
    sequence: AtomicU64,
}

/// How one connection's text lines up with what was already delivered
#[derive(Debug, Default)]
struct Replay {
    /// Text received on this connection
    received: String,
    /// Set once the connection has moved past the delivered text
    synced: bool,
}

/// What to hand the consumer for one received delta
#[derive(Debug, PartialEq, Eq)]
enum Emit {
    /// Already delivered by an earlier connection
    Skip,
    /// New text to append
    Append(String),
    /// The connection diverged; the consumer must start over with this text
    Replace(String),
}

/// Line up `text`, the next delta of a connection, against `delivered`
///
/// A reconnect either replays the reply from the start or resumes after the
/// cursor. Replayed text is a prefix of what was delivered and is skipped; the
/// first text past it is appended. A first delta that is not a replay is a
/// resumption. Anything else means the server rewrote the reply.
fn reconcile(delivered: &str, replay: &mut Replay, text: &str) -> Emit {
    if replay.synced {
        replay.received.push_str(text);
        return Emit::Append(text.to_string());
    }

    let first = replay.received.is_empty();
    replay.received.push_str(text);
    if delivered.starts_with(replay.received.as_str()) {
        return Emit::Skip;
    }

    replay.synced = true;
    if let Some(rest) = replay.received.strip_prefix(delivered) {
        return Emit::Append(rest.to_string());
    }
    if first {
        return Emit::Append(text.to_string());
    }
    Emit::Replace(replay.received.clone())
}

enum Flow {
    Continue,
    Stop,
}

impl PushSession {
    fn start_reader(self: &Arc<Self>, id: StreamId, bytes: ByteStream) {
        // Events at or below this id are replays of what was already delivered.
        let floor = self.cursor.lock().last_applied;
        let handle = tokio::spawn(Arc::clone(self).read(id, bytes, floor));
        self.slot.replace(handle.abort_handle());
    }

    async fn read(self: Arc<Self>, id: StreamId, mut bytes: ByteStream, floor: Option<u64>) {
        let (event_tx, mut events) = mpsc::unbounded_channel();
        let mut replay = Replay::default();
        let (mut parser, mut stale) = EventParser::with_heartbeat(self.parser.clone(), event_tx);

        loop {
            let mut ended = false;
            tokio::select! {
                chunk = bytes.next() => match chunk {
                    Some(Ok(chunk)) => parser.feed_bytes(&chunk),
                    Some(Err(e)) => {
                        if let Flow::Stop = self.drain(id, &mut events, &mut replay, floor).await {
                            return;
                        }
                        self.registry.report_failure(id, e);
                        return;
                    }
                    None => {
                        parser.close();
                        ended = true;
                    }
                },
                Some(notice) = stale.recv() => {
                    tracing::warn!(stream_id = %id, idle_ms = notice.idle_for.as_millis() as u64, "Push stream went silent");
                    self.registry.report_failure(id, TetherError::StaleConnection { idle: notice.idle_for });
                    return;
                }
            }

            if let Flow::Stop = self.drain(id, &mut events, &mut replay, floor).await {
                return;
            }
            if parser.is_done() {
                self.finish(id, None).await;
                return;
            }
            if ended {
                self.registry.report_failure(
                    id,
                    TetherError::Transport("stream ended before completion".into()),
                );
                return;
            }
        }
    }

    async fn drain(
        &self,
        id: StreamId,
        events: &mut mpsc::UnboundedReceiver<StreamEvent>,
        replay: &mut Replay,
        floor: Option<u64>,
    ) -> Flow {
        while let Ok(event) = events.try_recv() {
            if let Flow::Stop = self.apply(id, event, replay, floor).await {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    async fn apply(
        &self,
        id: StreamId,
        event: StreamEvent,
        replay: &mut Replay,
        floor: Option<u64>,
    ) -> Flow {
        let payload = match decode_payload(&event.data) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!(stream_id = %id, error = %e, "Dropping undecodable event");
                return Flow::Continue;
            }
        };

        let numeric = event.numeric_id();
        if let (Some(n), Some(floor)) = (numeric, floor) {
            if n <= floor {
                tracing::trace!(stream_id = %id, event_id = n, "Skipping replayed event");
                return Flow::Continue;
            }
        }

        {
            let mut cursor = self.cursor.lock();
            if let Some(event_id) = &event.id {
                cursor.last_event_id = Some(event_id.clone());
            }
            if let Some(n) = numeric {
                cursor.last_applied = Some(cursor.last_applied.map_or(n, |last| last.max(n)));
            }
        }

        match payload {
            Payload::Error(message) => {
                tracing::warn!(stream_id = %id, "Server reported an error in the stream");
                self.terminate(TextChunk::Failed(TetherError::Remote(message))).await;
                self.release(id);
                Flow::Stop
            }
            Payload::Delta {
                content,
                finish_reason,
                ..
            } => {
                if let Some(text) = content.filter(|c| !c.is_empty()) {
                    let emit = {
                        let mut delivered = self.delivered.lock();
                        let emit = reconcile(&delivered, replay, &text);
                        match &emit {
                            Emit::Skip => {}
                            Emit::Append(delta) => delivered.push_str(delta),
                            Emit::Replace(full) => delivered.clone_from(full),
                        }
                        emit
                    };

                    let (update, chunks) = match emit {
                        Emit::Skip => {
                            tracing::trace!(stream_id = %id, "Skipping replayed text");
                            (None, Vec::new())
                        }
                        Emit::Append(delta) => (
                            Some(ProgressUpdate::appended(delta.clone())),
                            vec![TextChunk::Delta(delta)],
                        ),
                        Emit::Replace(full) => {
                            tracing::debug!(stream_id = %id, "Reconnected stream rewrote the reply");
                            (
                                Some(ProgressUpdate::snapshot(full.clone())),
                                vec![TextChunk::Replace, TextChunk::Delta(full)],
                            )
                        }
                    };

                    if let Some(update) = update {
                        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
                        let mut update = update.with_sequence(sequence);
                        update.last_event_id = event.id.clone();
                        self.registry.update_progress(id, update);

                        let Some(tx) = self.sender() else {
                            return Flow::Stop;
                        };
                        for chunk in chunks {
                            if tx.send(chunk).await.is_err() {
                                tracing::debug!(stream_id = %id, "Consumer dropped the stream");
                                self.release(id);
                                return Flow::Stop;
                            }
                        }
                    }
                }
                if let Some(reason) = finish_reason {
                    self.finish(id, Some(reason)).await;
                    return Flow::Stop;
                }
                Flow::Continue
            }
        }
    }

    async fn finish(&self, id: StreamId, reason: Option<String>) {
        tracing::info!(stream_id = %id, "Push stream completed");
        self.terminate(TextChunk::Finished { reason }).await;
        self.release(id);
    }

    fn sender(&self) -> Option<mpsc::Sender<TextChunk>> {
        self.chunks.lock().clone()
    }

    /// Send the one terminal chunk; later calls do nothing
    async fn terminate(&self, chunk: TextChunk) {
        let tx = self.chunks.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(chunk).await;
        }
    }

    /// Unregister from a separate task: unregistering aborts the reader,
    /// which may be the caller.
    fn release(&self, id: StreamId) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            registry.unregister(id).await;
        });
    }
}

/// Relays registry notices; a terminal failure becomes the consumer's last chunk
async fn forward_notices(session: Arc<PushSession>, mut notices: mpsc::UnboundedReceiver<StreamNotice>) {
    while let Some(notice) = notices.recv().await {
        let id = session.stream_id.get().copied();
        match notice {
            StreamNotice::Failed(error) => {
                session.terminate(TextChunk::Failed(error)).await;
                break;
            }
            other => {
                if let Some(id) = id {
                    tracing::debug!(stream_id = %id, notice = ?other, "Stream notice");
                }
            }
        }
    }
}

/// Reconnects a push stream from its resumption cursor
struct PushRecovery(Arc<PushSession>);

#[async_trait]
impl RecoveryCallback for PushRecovery {
    async fn attempt_recovery(&self, context: RecoveryContext) -> Result<(), TetherError> {
        let session = &self.0;
        let cursor = session.cursor.lock().last_event_id.clone();
        let request = session
            .request
            .clone()
            .with_last_event_id(cursor.or(context.metadata.last_event_id));

        let bytes = session.transport.open(&request).await?;
        session.start_reader(context.stream_id, bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn feed(delivered: &str, deltas: &[&str]) -> Vec<Emit> {
        let mut replay = Replay::default();
        let mut delivered = delivered.to_string();
        deltas
            .iter()
            .map(|text| {
                let emit = reconcile(&delivered, &mut replay, text);
                match &emit {
                    Emit::Append(delta) => delivered.push_str(delta),
                    Emit::Replace(full) => delivered.clone_from(full),
                    Emit::Skip => {}
                }
                emit
            })
            .collect()
    }

    #[test]
    fn test_first_connection_appends_everything() {
        assert_eq!(
            feed("", &["Hel", "lo"]),
            vec![Emit::Append("Hel".into()), Emit::Append("lo".into())]
        );
    }

    #[test]
    fn test_replay_from_start_is_skipped() {
        assert_eq!(
            feed("Hel", &["Hel", "lo"]),
            vec![Emit::Skip, Emit::Append("lo".into())]
        );
    }

    #[test]
    fn test_replay_overlapping_delivered_text_appends_suffix() {
        assert_eq!(
            feed("Hel", &["He", "llo", " there"]),
            vec![
                Emit::Skip,
                Emit::Append("lo".into()),
                Emit::Append(" there".into()),
            ]
        );
    }

    #[test]
    fn test_resume_after_cursor_appends() {
        assert_eq!(
            feed("Hel", &["lo", "!"]),
            vec![Emit::Append("lo".into()), Emit::Append("!".into())]
        );
    }

    #[test]
    fn test_divergent_replay_replaces() {
        assert_eq!(
            feed("Hello", &["He", "y there"]),
            vec![Emit::Skip, Emit::Replace("Hey there".into())]
        );
    }
}
