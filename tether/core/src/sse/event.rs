//! Parsed Server-Sent Event

use serde::{Deserialize, Serialize};

/// Sentinel `data` payload that ends a stream normally
pub const DONE_SENTINEL: &str = "[DONE]";

/// One dispatched event
///
/// `id` and `retry` carry over from earlier events until the server replaces
/// them; `event_type` and `data` belong to this event only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Last `id:` field seen on the stream
    pub id: Option<String>,
    /// `event:` field of this event, if any
    pub event_type: Option<String>,
    /// `data:` lines joined with `\n`
    pub data: String,
    /// Last `retry:` hint in milliseconds
    pub retry: Option<u64>,
}

impl StreamEvent {
    /// Create an event carrying only data
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    /// Event id parsed as a number, for ordering on resume
    #[must_use]
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.as_deref().and_then(|id| id.trim().parse().ok())
    }
}
