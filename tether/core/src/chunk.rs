//! Consumer-facing text chunks

use crate::error::TetherError;

/// One item of reply text delivered to the consumer
///
/// Each stream ends with exactly one terminal item ([`TextChunk::Finished`]
/// or [`TextChunk::Failed`]) after which the channel closes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TextChunk {
    /// Text to append
    Delta(String),
    /// Discard everything received so far; the next `Delta` is the full text
    Replace,
    /// The reply is complete
    Finished {
        /// Why generation stopped, if known
        reason: Option<String>,
    },
    /// The reply was interrupted
    Failed(TetherError),
}

impl TextChunk {
    /// Whether no further chunks follow
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::Failed(_))
    }

    /// Completion with a reason
    pub fn finished(reason: impl Into<String>) -> Self {
        Self::Finished {
            reason: Some(reason.into()),
        }
    }
}
