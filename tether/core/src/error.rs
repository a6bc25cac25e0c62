//! Error Types
//!
//! One error type crosses component boundaries: [`TetherError`]. Its variants
//! follow the resilience taxonomy: transient conditions are retried and absorbed,
//! terminal ones are surfaced to the consumer exactly once, authentication
//! failures are never retried here.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the transport-resilience core
///
/// Cloneable so a terminal error can be recorded in stream state and also
/// delivered to the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TetherError {
    /// Network drop, connection reset, body read failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Request or read timed out
    #[error("timed out: {0}")]
    Timeout(String),

    /// No data (not even keep-alives) for longer than the heartbeat timeout
    #[error("connection stale after {idle:?} without data")]
    StaleConnection {
        /// How long the connection had been silent
        idle: Duration,
    },

    /// Server answered with a status that carries no retry semantics
    #[error("server returned {status}: {message}")]
    Server {
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// The payload itself reported an error (`{"error": ...}`)
    #[error("remote error: {0}")]
    Remote(String),

    /// Credentials rejected; the caller must re-authenticate out-of-band
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Malformed event or JSON payload
    #[error("parse error: {0}")]
    Parse(String),

    /// Persisted state could not be read or written
    #[error("storage error: {0}")]
    Storage(String),

    /// Recovery or upload retries used up
    #[error("gave up after {attempts} attempts")]
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
    },

    /// The operation was cancelled by the caller
    #[error("cancelled")]
    Cancelled,

    /// Unknown stream or upload id
    #[error("not found: {0}")]
    NotFound(String),
}

impl TetherError {
    /// Whether this condition may heal by itself and should be retried
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout(_) | Self::StaleConnection { .. }
        )
    }

    /// Whether this error must reach the caller without any retry
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Map an unsuccessful HTTP status to an error
    ///
    /// 401/403 are authentication failures; 408, 429 and 5xx are transient;
    /// anything else is a terminal server error.
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => Self::Auth(message),
            408 | 429 | 500..=599 => Self::Transport(format!("HTTP {status}: {message}")),
            _ => Self::Server { status, message },
        }
    }
}

impl From<reqwest::Error> for TetherError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16(), err.to_string())
        } else if err.is_decode() {
            Self::Parse(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<crate::storage::StorageError> for TetherError {
    fn from(err: crate::storage::StorageError) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Convenience alias
pub type Result<T, E = TetherError> = std::result::Result<T, E>;
