//! Per-stream metadata
//!
//! `last_content` only ever grows, except through an explicit hard
//! replacement which bumps `content_revision` so observers can tell a rewrite
//! from a truncation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, MessageId, SessionId, StreamId};

/// Bookkeeping for one streamed reply
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Conversation the reply belongs to
    pub conversation_id: ConversationId,
    /// The reply message being generated
    pub message_id: MessageId,
    /// Server session binding, if any
    pub session_id: Option<SessionId>,
    /// Sequence number of the last applied chunk
    pub last_chunk_sequence: u64,
    /// Accumulated text delivered so far
    pub last_content: String,
    /// Incremented every time `last_content` is hard-replaced
    #[serde(default)]
    pub content_revision: u32,
    /// Last SSE event id, used as the resumption cursor
    #[serde(default)]
    pub last_event_id: Option<String>,
    /// Whether the stream is currently suspended
    pub suspended: bool,
    /// When it was suspended
    pub suspended_at: Option<DateTime<Utc>>,
    /// Last time anything about the stream changed
    pub last_update: DateTime<Utc>,
}

impl StreamMetadata {
    /// Fresh metadata for a new reply
    #[must_use]
    pub fn new(conversation_id: ConversationId, message_id: MessageId) -> Self {
        Self {
            conversation_id,
            message_id,
            session_id: None,
            last_chunk_sequence: 0,
            last_content: String::new(),
            content_revision: 0,
            last_event_id: None,
            suspended: false,
            suspended_at: None,
            last_update: Utc::now(),
        }
    }

    /// Attach a server session binding
    #[must_use]
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Apply a content update, preserving the monotonic-content rule
    pub fn apply_content(&mut self, update: ContentUpdate) -> ContentChange {
        match update {
            ContentUpdate::Append(delta) => {
                if delta.is_empty() {
                    return ContentChange::Unchanged;
                }
                self.last_content.push_str(&delta);
                ContentChange::Appended { delta }
            }
            ContentUpdate::Snapshot(snapshot) => {
                if snapshot == self.last_content {
                    ContentChange::Unchanged
                } else if let Some(delta) = snapshot.strip_prefix(self.last_content.as_str()) {
                    let delta = delta.to_string();
                    self.last_content = snapshot;
                    ContentChange::Appended { delta }
                } else {
                    let previous_len = self.last_content.len();
                    self.last_content = snapshot;
                    self.content_revision += 1;
                    ContentChange::Replaced { previous_len }
                }
            }
        }
    }

    /// Mark suspended at `now` (keeps the first suspension time)
    pub fn mark_suspended(&mut self, now: DateTime<Utc>) {
        if !self.suspended {
            self.suspended = true;
            self.suspended_at = Some(now);
        }
    }

    /// Clear the suspension flag
    pub fn mark_resumed(&mut self, now: DateTime<Utc>) {
        self.suspended = false;
        self.suspended_at = None;
        self.last_update = now;
    }
}

/// A change to the accumulated content
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContentUpdate {
    /// Delta to append
    Append(String),
    /// Full snapshot; treated as an append when it extends the current text
    Snapshot(String),
}

/// What an update did to the accumulated content
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContentChange {
    /// Nothing new
    Unchanged,
    /// Text grew by `delta`
    Appended {
        /// The new suffix
        delta: String,
    },
    /// Text was rewritten rather than extended
    Replaced {
        /// Length of the content that was replaced
        previous_len: usize,
    },
}

/// Persisted form: metadata keyed by stream id
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    /// Stream the metadata belongs to
    pub stream_id: StreamId,
    /// Snapshot of the metadata
    pub metadata: StreamMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn meta() -> StreamMetadata {
        StreamMetadata::new("conv".into(), "msg".into())
    }

    #[test]
    fn test_append_grows_content() {
        let mut m = meta();
        assert_eq!(
            m.apply_content(ContentUpdate::Append("Hel".into())),
            ContentChange::Appended {
                delta: "Hel".into()
            }
        );
        m.apply_content(ContentUpdate::Append("lo".into()));
        assert_eq!(m.last_content, "Hello");
        assert_eq!(
            m.apply_content(ContentUpdate::Append(String::new())),
            ContentChange::Unchanged
        );
    }

    #[test]
    fn test_extending_snapshot_is_append() {
        let mut m = meta();
        m.apply_content(ContentUpdate::Append("Hello".into()));
        assert_eq!(
            m.apply_content(ContentUpdate::Snapshot("Hello world".into())),
            ContentChange::Appended {
                delta: " world".into()
            }
        );
        assert_eq!(m.content_revision, 0);
    }

    #[test]
    fn test_diverging_snapshot_is_tagged_replacement() {
        let mut m = meta();
        m.apply_content(ContentUpdate::Append("Hello wrld".into()));
        assert_eq!(
            m.apply_content(ContentUpdate::Snapshot("Hello".into())),
            ContentChange::Replaced { previous_len: 10 }
        );
        assert_eq!(m.last_content, "Hello");
        assert_eq!(m.content_revision, 1);
    }

    #[test]
    fn test_suspend_keeps_first_timestamp() {
        let mut m = meta();
        let t0 = Utc::now();
        m.mark_suspended(t0);
        m.mark_suspended(t0 + chrono::Duration::seconds(10));
        assert_eq!(m.suspended_at, Some(t0));

        m.mark_resumed(t0 + chrono::Duration::seconds(20));
        assert!(!m.suspended);
        assert_eq!(m.suspended_at, None);
    }

    #[test]
    fn test_record_serde_round_trip() {
        let mut m = meta().with_session("sess".into());
        m.apply_content(ContentUpdate::Append("partial".into()));
        m.last_chunk_sequence = 4;
        m.last_event_id = Some("4".into());
        m.mark_suspended(Utc::now());

        let record = RecoveryRecord {
            stream_id: StreamId::new(),
            metadata: m,
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: RecoveryRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
