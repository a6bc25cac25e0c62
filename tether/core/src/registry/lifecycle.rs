//! Lifecycle signals, stream states and the recovery seam

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TetherError;
use crate::ids::StreamId;
use crate::recovery::StreamMetadata;

/// Signals forwarded from the host application
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleEvent {
    /// App returned to the foreground
    Foreground,
    /// App moved to the background
    Background,
    /// Background time is about to expire; save state now
    AboutToSuspend,
    /// Network came back
    ConnectivityRestored,
    /// Network went away
    ConnectivityLost,
}

/// Whether the app is visible
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppState {
    /// Visible and running
    #[default]
    Foreground,
    /// Not visible; may be suspended by the host
    Background,
}

/// Lifecycle state of one registered stream
///
/// Terminal failure is not a state: a failed stream is reported once on its
/// progress sink and removed from the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    /// Receiving data
    Active,
    /// Transport lost; waiting for a trigger to recover
    Suspended,
    /// A recovery attempt is running or scheduled
    Recovering,
}

/// Per-stream notices delivered on the progress sink
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamNotice {
    /// The transport was dropped; recovery will follow a trigger
    Suspended,
    /// Attempt number `attempt` is starting
    Recovering {
        /// 1-based attempt number
        attempt: u32,
    },
    /// Last attempt failed; another one is scheduled
    RetryScheduled {
        /// Failure count so far
        attempt: u32,
        /// Wait before the next attempt
        delay: Duration,
    },
    /// The stream is flowing again
    Recovered,
    /// Terminal; the stream has been removed from the registry
    Failed(TetherError),
}

impl StreamNotice {
    /// Whether this is the last notice for the stream
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// What a recovery attempt gets to work with
#[derive(Clone, Debug)]
pub struct RecoveryContext {
    /// Stream being recovered
    pub stream_id: StreamId,
    /// 1-based attempt number since the last success
    pub attempt: u32,
    /// Snapshot of the stream's metadata when the attempt started
    pub metadata: StreamMetadata,
}

/// Re-establishes one stream's transport
///
/// Implemented per stream origin (push stream, polling job, ...). Returning
/// `Ok` means data is flowing again. Retryable errors are retried with
/// backoff; any other error fails the stream.
#[async_trait]
pub trait RecoveryCallback: Send + Sync {
    /// Try to resume the stream
    async fn attempt_recovery(&self, context: RecoveryContext) -> Result<(), TetherError>;
}

/// Progress reported by the transport for one stream
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// Sequence number of the chunk just applied
    pub chunk_sequence: Option<u64>,
    /// Full content snapshot (replaces the accumulated text)
    pub content: Option<String>,
    /// Delta to append to the accumulated text
    pub appended_content: Option<String>,
    /// Latest event id from the transport
    pub last_event_id: Option<String>,
}

impl ProgressUpdate {
    /// Update that appends a delta
    pub fn appended(delta: impl Into<String>) -> Self {
        Self {
            appended_content: Some(delta.into()),
            ..Default::default()
        }
    }

    /// Update that carries a full snapshot
    pub fn snapshot(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    /// Set the chunk sequence
    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.chunk_sequence = Some(sequence);
        self
    }

    /// Set the event id cursor
    #[must_use]
    pub fn with_event_id(mut self, id: impl Into<String>) -> Self {
        self.last_event_id = Some(id.into());
        self
    }
}
