//! Delta Poller
//!
//! Fallback for replies the server runs as a background job instead of
//! streaming. The in-progress reply is fetched repeatedly and diffed against
//! what was already delivered:
//!
//! ```text
//!   fetch ──► extract(message id) ──► diff(previous, current)
//!                                        │
//!                      prefix-extension ─┼─► Delta(suffix)
//!                      anything else ────┴─► Replace + Delta(full)
//! ```
//!
//! The resource schema drifts between server versions, so extraction tries
//! several shapes before falling back to the newest entry with the expected
//! role.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::chunk::TextChunk;
use crate::error::TetherError;

/// Status values that mark a reply as finished
const DONE_STATUSES: &[&str] = &["completed", "complete", "done", "finished"];

/// Source of resource snapshots
#[async_trait]
pub trait PollingEndpoint: Send + Sync {
    /// Fetch the current snapshot of a resource
    async fn fetch(&self, resource_id: &str) -> Result<Value, TetherError>;
}

/// Poller configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Time between fetches
    pub interval: Duration,
    /// Hard stop for the whole poll loop
    pub timeout: Duration,
    /// Unchanged non-empty observations that count as completion
    pub stable_ticks: u32,
    /// Role used by the last-resort lookup
    pub role: String,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(900),
            timeout: Duration::from_secs(180),
            stable_ticks: 3,
            role: "assistant".to_string(),
        }
    }
}

/// How a poll loop ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// A done marker was seen
    Completed,
    /// Content stopped changing
    Stable,
    /// The global timeout elapsed
    TimedOut,
    /// The consumer dropped its receiver
    Abandoned,
}

impl PollOutcome {
    fn finish_reason(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Stable => "stable",
            Self::TimedOut => "timeout",
            Self::Abandoned => "abandoned",
        }
    }
}

/// Which lookup found the entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupSource {
    /// `messages` array, matched by id
    MessageList,
    /// `mapping` / `messages_by_id` map, keyed by id
    MessageMap,
    /// Snapshot is itself an array, matched by id
    TopLevelList,
    /// Newest entry with the expected role
    LatestByRole,
}

/// Content extracted from a snapshot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Extracted {
    /// Current text of the reply
    pub content: String,
    /// Whether a done marker was present
    pub done: bool,
    /// Lookup that matched
    pub source: LookupSource,
}

/// Relation between delivered and current content
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContentDiff {
    /// Nothing new
    Unchanged,
    /// Current text extends the previous text by this suffix
    Append(String),
    /// Current text rewrites the previous text
    Replace(String),
}

/// Compare delivered content with a fresh snapshot
#[must_use]
pub fn diff_content(previous: &str, current: &str) -> ContentDiff {
    if previous == current {
        ContentDiff::Unchanged
    } else if let Some(suffix) = current.strip_prefix(previous) {
        ContentDiff::Append(suffix.to_string())
    } else {
        ContentDiff::Replace(current.to_string())
    }
}

/// Find the reply `message_id` in a resource snapshot
///
/// Returns `None` when neither the id nor any entry with `role` is present.
#[must_use]
pub fn extract_content(snapshot: &Value, message_id: &str, role: &str) -> Option<Extracted> {
    let resource_done = has_done_marker(snapshot);

    let (entry, source) = lookup_by_id(snapshot, message_id).or_else(|| {
        latest_with_role(snapshot, role).map(|entry| (entry, LookupSource::LatestByRole))
    })?;

    if source == LookupSource::LatestByRole {
        tracing::debug!(message_id, role, "Message id not found, using latest entry for role");
    }

    Some(Extracted {
        content: entry_text(entry).unwrap_or_default(),
        done: resource_done || has_done_marker(entry),
        source,
    })
}

fn lookup_by_id<'a>(snapshot: &'a Value, message_id: &str) -> Option<(&'a Value, LookupSource)> {
    if let Some(entry) = snapshot
        .get("messages")
        .and_then(Value::as_array)
        .and_then(|list| find_by_id(list, message_id))
    {
        return Some((entry, LookupSource::MessageList));
    }

    for key in ["mapping", "messages_by_id"] {
        if let Some(entry) = snapshot
            .get(key)
            .and_then(Value::as_object)
            .and_then(|map| map.get(message_id))
        {
            return Some((unwrap_node(entry), LookupSource::MessageMap));
        }
    }

    snapshot
        .as_array()
        .and_then(|list| find_by_id(list, message_id))
        .map(|entry| (entry, LookupSource::TopLevelList))
}

fn latest_with_role<'a>(snapshot: &'a Value, role: &str) -> Option<&'a Value> {
    let lists = [snapshot.get("messages"), Some(snapshot)];
    for list in lists.into_iter().flatten().filter_map(Value::as_array) {
        if let Some(entry) = list
            .iter()
            .rev()
            .map(unwrap_node)
            .find(|e| entry_role(e) == Some(role))
        {
            return Some(entry);
        }
    }

    for key in ["mapping", "messages_by_id"] {
        let Some(map) = snapshot.get(key).and_then(Value::as_object) else {
            continue;
        };
        // Map order carries no meaning; newest by creation time wins.
        let newest = map
            .values()
            .map(unwrap_node)
            .filter(|e| entry_role(e) == Some(role))
            .max_by(|a, b| created_at(a).total_cmp(&created_at(b)));
        if newest.is_some() {
            return newest;
        }
    }
    None
}

fn find_by_id<'a>(list: &'a [Value], message_id: &str) -> Option<&'a Value> {
    list.iter()
        .map(unwrap_node)
        .find(|entry| entry.get("id").and_then(Value::as_str) == Some(message_id))
}

/// Map nodes may wrap the message as `{ "message": { .. } }`
fn unwrap_node(entry: &Value) -> &Value {
    entry
        .get("message")
        .filter(|m| m.is_object())
        .unwrap_or(entry)
}

fn entry_role(entry: &Value) -> Option<&str> {
    entry
        .get("role")
        .and_then(Value::as_str)
        .or_else(|| entry.pointer("/author/role").and_then(Value::as_str))
}

fn created_at(entry: &Value) -> f64 {
    entry
        .get("create_time")
        .or_else(|| entry.get("created_at"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

fn entry_text(entry: &Value) -> Option<String> {
    match entry.get("content")? {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => Some(join_parts(parts)),
        Value::Object(body) => body
            .get("parts")
            .and_then(Value::as_array)
            .map(|parts| join_parts(parts)),
        _ => None,
    }
}

fn join_parts(parts: &[Value]) -> String {
    parts
        .iter()
        .filter_map(|part| match part {
            Value::String(text) => Some(text.as_str()),
            Value::Object(_) => {
                let kind = part.get("type").and_then(Value::as_str);
                if kind.map_or(true, |k| k == "text" || k == "output_text") {
                    part.get("text").and_then(Value::as_str)
                } else {
                    None
                }
            }
            _ => None,
        })
        .collect()
}

fn has_done_marker(value: &Value) -> bool {
    let status_done = value
        .get("status")
        .and_then(Value::as_str)
        .is_some_and(|status| DONE_STATUSES.contains(&status.to_ascii_lowercase().as_str()));
    let flag = |key: &str| value.get(key).and_then(Value::as_bool).unwrap_or(false);
    status_done || flag("done") || flag("end_turn")
}

/// The consumer dropped its receiver
struct Abandoned;

/// Drives one poll loop per background job
pub struct DeltaPoller {
    endpoint: Arc<dyn PollingEndpoint>,
    config: PollerConfig,
}

impl DeltaPoller {
    /// Create a poller
    pub fn new(endpoint: Arc<dyn PollingEndpoint>, config: PollerConfig) -> Self {
        Self { endpoint, config }
    }

    /// Poller configuration
    #[must_use]
    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Poll `resource_id` until reply `message_id` completes or the timeout elapses
    ///
    /// Fetch errors and unreadable snapshots are swallowed; only the global
    /// timeout or completion ends the loop. After the loop ends one final
    /// fetch catches text written after the last tick, then a
    /// [`TextChunk::Finished`] closes the stream.
    ///
    /// # Errors
    ///
    /// An authentication error is sent to the sink as [`TextChunk::Failed`]
    /// and returned.
    pub async fn poll(
        &self,
        resource_id: &str,
        message_id: &str,
        sink: mpsc::Sender<TextChunk>,
    ) -> Result<PollOutcome, TetherError> {
        let deadline = Instant::now() + self.config.timeout;
        let mut delivered = String::new();
        let mut unchanged_ticks = 0u32;

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(resource_id, message_id, "Polling started");

        let outcome = loop {
            ticker.tick().await;

            let fetched = match tokio::time::timeout_at(deadline, self.fetch(resource_id, message_id)).await {
                Ok(fetched) => fetched,
                Err(_) => break PollOutcome::TimedOut,
            };

            match fetched {
                Ok(Some(extracted))
                    if extracted.content.is_empty() && !delivered.is_empty() && !extracted.done =>
                {
                    tracing::debug!(resource_id, message_id, "Reply content missing, keeping delivered text");
                }
                Ok(Some(extracted)) => {
                    let changed = match emit(&sink, &mut delivered, &extracted.content).await {
                        Ok(changed) => changed,
                        Err(Abandoned) => break PollOutcome::Abandoned,
                    };
                    if extracted.done {
                        break PollOutcome::Completed;
                    }
                    if changed {
                        unchanged_ticks = 0;
                    } else if !delivered.is_empty() {
                        unchanged_ticks += 1;
                        if unchanged_ticks >= self.config.stable_ticks {
                            break PollOutcome::Stable;
                        }
                    }
                }
                Ok(None) => {
                    tracing::debug!(resource_id, message_id, "Reply not present yet");
                }
                Err(e @ TetherError::Auth(_)) => {
                    tracing::warn!(resource_id, error = %e, "Polling aborted");
                    let _ = sink.send(TextChunk::Failed(e.clone())).await;
                    return Err(e);
                }
                Err(e) => {
                    tracing::debug!(resource_id, error = %e, "Poll fetch failed, continuing");
                }
            }

            if Instant::now() >= deadline {
                break PollOutcome::TimedOut;
            }
        };

        if outcome == PollOutcome::Abandoned {
            tracing::debug!(resource_id, "Consumer went away, polling stopped");
            return Ok(outcome);
        }

        // One last pass for text written after the final tick.
        let last = tokio::time::timeout(self.config.interval, self.fetch(resource_id, message_id)).await;
        if let Ok(Ok(Some(extracted))) = last {
            if emit(&sink, &mut delivered, &extracted.content).await.is_err() {
                return Ok(PollOutcome::Abandoned);
            }
        }

        tracing::info!(
            resource_id,
            outcome = ?outcome,
            chars = delivered.chars().count(),
            "Polling finished"
        );
        let _ = sink.send(TextChunk::finished(outcome.finish_reason())).await;
        Ok(outcome)
    }

    async fn fetch(&self, resource_id: &str, message_id: &str) -> Result<Option<Extracted>, TetherError> {
        let snapshot = self.endpoint.fetch(resource_id).await?;
        Ok(extract_content(&snapshot, message_id, &self.config.role))
    }
}

/// Send whatever changed; returns whether anything was sent
async fn emit(
    sink: &mpsc::Sender<TextChunk>,
    delivered: &mut String,
    current: &str,
) -> Result<bool, Abandoned> {
    // Missing content is a gap in the snapshot, not a rewrite.
    if current.is_empty() && !delivered.is_empty() {
        return Ok(false);
    }
    match diff_content(delivered, current) {
        ContentDiff::Unchanged => Ok(false),
        ContentDiff::Append(delta) => {
            sink.send(TextChunk::Delta(delta)).await.map_err(|_| Abandoned)?;
            *delivered = current.to_string();
            Ok(true)
        }
        ContentDiff::Replace(full) => {
            sink.send(TextChunk::Replace).await.map_err(|_| Abandoned)?;
            sink.send(TextChunk::Delta(full.clone())).await.map_err(|_| Abandoned)?;
            *delivered = full;
            Ok(true)
        }
    }
}

impl std::fmt::Debug for DeltaPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaPoller")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Serves scripted responses, then repeats the last successful snapshot
    struct ScriptedEndpoint {
        script: Mutex<VecDeque<Result<Value, TetherError>>>,
        last: Mutex<Value>,
        fetches: AtomicU32,
    }

    impl ScriptedEndpoint {
        fn new(script: Vec<Result<Value, TetherError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(json!({ "messages": [] })),
                fetches: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl PollingEndpoint for ScriptedEndpoint {
        async fn fetch(&self, _resource_id: &str) -> Result<Value, TetherError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().pop_front() {
                Some(Ok(snapshot)) => {
                    *self.last.lock() = snapshot.clone();
                    Ok(snapshot)
                }
                Some(Err(e)) => Err(e),
                None => Ok(self.last.lock().clone()),
            }
        }
    }

    fn reply(content: &str, status: &str) -> Value {
        json!({
            "messages": [
                { "id": "user-1", "role": "user", "content": "hi" },
                { "id": "msg-1", "role": "assistant", "content": content, "status": status }
            ]
        })
    }

    fn config() -> PollerConfig {
        PollerConfig {
            interval: Duration::from_millis(900),
            timeout: Duration::from_secs(10),
            stable_ticks: 3,
            role: "assistant".into(),
        }
    }

    async fn run(endpoint: Arc<ScriptedEndpoint>) -> (Result<PollOutcome, TetherError>, Vec<TextChunk>) {
        let poller = DeltaPoller::new(endpoint, config());
        let (tx, mut rx) = mpsc::channel(64);
        let result = poller.poll("job-1", "msg-1", tx).await;
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        (result, chunks)
    }

    fn concat(chunks: &[TextChunk]) -> String {
        let mut text = String::new();
        for chunk in chunks {
            match chunk {
                TextChunk::Delta(delta) => text.push_str(delta),
                TextChunk::Replace => text.clear(),
                _ => {}
            }
        }
        text
    }

    #[test]
    fn test_diff_content() {
        assert_eq!(diff_content("abc", "abc"), ContentDiff::Unchanged);
        assert_eq!(diff_content("", "abc"), ContentDiff::Append("abc".into()));
        assert_eq!(diff_content("ab", "abc"), ContentDiff::Append("c".into()));
        assert_eq!(diff_content("abd", "abc"), ContentDiff::Replace("abc".into()));
        assert_eq!(diff_content("abc", "ab"), ContentDiff::Replace("ab".into()));
    }

    #[test]
    fn test_extract_from_message_list() {
        let extracted = extract_content(&reply("Hello", "in_progress"), "msg-1", "assistant").unwrap();
        assert_eq!(extracted.content, "Hello");
        assert!(!extracted.done);
        assert_eq!(extracted.source, LookupSource::MessageList);
    }

    #[test]
    fn test_extract_from_mapping_with_parts() {
        let snapshot = json!({
            "mapping": {
                "msg-1": {
                    "message": {
                        "id": "msg-1",
                        "author": { "role": "assistant" },
                        "content": { "content_type": "text", "parts": ["Hel", "lo"] },
                        "end_turn": true
                    }
                }
            }
        });
        let extracted = extract_content(&snapshot, "msg-1", "assistant").unwrap();
        assert_eq!(extracted.content, "Hello");
        assert!(extracted.done);
        assert_eq!(extracted.source, LookupSource::MessageMap);
    }

    #[test]
    fn test_extract_from_top_level_list_with_typed_parts() {
        let snapshot = json!([
            {
                "id": "msg-1",
                "role": "assistant",
                "content": [
                    { "type": "text", "text": "Hi " },
                    { "type": "image", "url": "x" },
                    { "type": "text", "text": "there" }
                ],
                "done": true
            }
        ]);
        let extracted = extract_content(&snapshot, "msg-1", "assistant").unwrap();
        assert_eq!(extracted.content, "Hi there");
        assert!(extracted.done);
        assert_eq!(extracted.source, LookupSource::TopLevelList);
    }

    #[test]
    fn test_extract_falls_back_to_latest_role() {
        let snapshot = json!({
            "status": "completed",
            "messages": [
                { "id": "a", "role": "assistant", "content": "old" },
                { "id": "u", "role": "user", "content": "question" },
                { "id": "b", "author": { "role": "assistant" }, "content": "new" }
            ]
        });
        let extracted = extract_content(&snapshot, "missing", "assistant").unwrap();
        assert_eq!(extracted.content, "new");
        assert!(extracted.done);
        assert_eq!(extracted.source, LookupSource::LatestByRole);

        assert!(extract_content(&snapshot, "missing", "tool").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefix_snapshots_emit_each_byte_once() {
        let endpoint = ScriptedEndpoint::new(vec![
            Ok(reply("He", "in_progress")),
            Ok(reply("Hello", "in_progress")),
            Ok(reply("Hello world", "completed")),
        ]);
        let (result, chunks) = run(endpoint).await;

        assert_eq!(result.unwrap(), PollOutcome::Completed);
        assert_eq!(
            chunks,
            vec![
                TextChunk::Delta("He".into()),
                TextChunk::Delta("llo".into()),
                TextChunk::Delta(" world".into()),
                TextChunk::finished("completed"),
            ]
        );
        assert_eq!(concat(&chunks), "Hello world");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewritten_content_sends_replace() {
        let endpoint = ScriptedEndpoint::new(vec![
            Ok(reply("Hello wrld", "in_progress")),
            Ok(reply("Hello world", "done")),
        ]);
        let (_, chunks) = run(endpoint).await;

        assert_eq!(
            chunks,
            vec![
                TextChunk::Delta("Hello wrld".into()),
                TextChunk::Replace,
                TextChunk::Delta("Hello world".into()),
                TextChunk::finished("completed"),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_content_completes_after_stable_ticks() {
        let endpoint = ScriptedEndpoint::new(vec![Ok(reply("steady", "in_progress"))]);
        let started = Instant::now();
        let (result, chunks) = run(endpoint.clone()).await;

        assert_eq!(result.unwrap(), PollOutcome::Stable);
        assert_eq!(concat(&chunks), "steady");
        assert_eq!(chunks.last(), Some(&TextChunk::finished("stable")));
        // first fetch + 3 unchanged ticks + final pass
        assert_eq!(endpoint.fetches.load(Ordering::SeqCst), 5);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_content_times_out() {
        let endpoint = ScriptedEndpoint::new(vec![Ok(reply("", "in_progress"))]);
        let (result, chunks) = run(endpoint).await;

        assert_eq!(result.unwrap(), PollOutcome::TimedOut);
        assert_eq!(chunks, vec![TextChunk::finished("timeout")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_pass_catches_late_text() {
        let endpoint = ScriptedEndpoint::new(vec![
            Ok(reply("partial", "completed")),
            Ok(reply("partial and more", "completed")),
        ]);
        let (_, chunks) = run(endpoint).await;
        assert_eq!(concat(&chunks), "partial and more");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_swallowed() {
        let endpoint = ScriptedEndpoint::new(vec![
            Err(TetherError::Transport("reset".into())),
            Err(TetherError::Timeout("read deadline".into())),
            Ok(reply("done now", "completed")),
        ]);
        let (result, chunks) = run(endpoint).await;

        assert_eq!(result.unwrap(), PollOutcome::Completed);
        assert_eq!(concat(&chunks), "done now");
        assert!(!chunks.iter().any(|c| matches!(c, TextChunk::Failed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_snapshot_and_missing_resource_swallowed() {
        let endpoint = ScriptedEndpoint::new(vec![
            Err(TetherError::Parse("gateway returned html".into())),
            Err(TetherError::Server {
                status: 404,
                message: "no such job".into(),
            }),
            Ok(reply("finally", "completed")),
        ]);
        let (result, chunks) = run(endpoint).await;

        assert_eq!(result.unwrap(), PollOutcome::Completed);
        assert_eq!(
            chunks,
            vec![
                TextChunk::Delta("finally".into()),
                TextChunk::finished("completed"),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_content_keeps_delivered_text() {
        let endpoint = ScriptedEndpoint::new(vec![
            Ok(reply("Hello", "in_progress")),
            Ok(json!({
                "messages": [
                    { "id": "msg-1", "role": "assistant", "content": null, "status": "in_progress" }
                ]
            })),
            Ok(reply("Hello world", "completed")),
        ]);
        let (_, chunks) = run(endpoint).await;

        assert_eq!(
            chunks,
            vec![
                TextChunk::Delta("Hello".into()),
                TextChunk::Delta(" world".into()),
                TextChunk::finished("completed"),
            ]
        );
    }

    /// Answers once, then never again
    struct StallingEndpoint {
        answered: AtomicU32,
    }

    #[async_trait]
    impl PollingEndpoint for StallingEndpoint {
        async fn fetch(&self, _resource_id: &str) -> Result<Value, TetherError> {
            if self.answered.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(reply("all of it", "completed"));
            }
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_pass_is_bounded() {
        let poller = DeltaPoller::new(
            Arc::new(StallingEndpoint {
                answered: AtomicU32::new(0),
            }),
            config(),
        );
        let (tx, mut rx) = mpsc::channel(8);
        let started = Instant::now();

        let result = poller.poll("job-1", "msg-1", tx).await;

        assert_eq!(result.unwrap(), PollOutcome::Completed);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(rx.recv().await, Some(TextChunk::Delta("all of it".into())));
        assert_eq!(rx.recv().await, Some(TextChunk::finished("completed")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_error_propagates_once() {
        let endpoint = ScriptedEndpoint::new(vec![Err(TetherError::Auth("expired".into()))]);
        let (result, chunks) = run(endpoint).await;

        assert_eq!(result.unwrap_err(), TetherError::Auth("expired".into()));
        assert_eq!(chunks, vec![TextChunk::Failed(TetherError::Auth("expired".into()))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_receiver_abandons() {
        let endpoint = ScriptedEndpoint::new(vec![Ok(reply("text", "in_progress"))]);
        let poller = DeltaPoller::new(endpoint, config());
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        assert_eq!(poller.poll("job-1", "msg-1", tx).await.unwrap(), PollOutcome::Abandoned);
    }
}
