//! Queued upload items

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

use crate::error::TetherError;
use crate::ids::UploadId;
use crate::retry::RetryState;

/// Upload lifecycle
///
/// `Pending ⇄ Uploading → Completed | Pending (retry scheduled) | Failed`.
/// `Cancelled` is reached only by explicit request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// Waiting for its turn (possibly after a failed attempt)
    Pending,
    /// An upload call is in flight
    Uploading,
    /// The server accepted the file
    Completed,
    /// Attempts exhausted or a non-retryable error occurred
    Failed,
    /// Cancelled by the user
    Cancelled,
}

impl UploadStatus {
    /// Whether the item waits for explicit action
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One attachment in the queue
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedUploadItem {
    /// Queue-local id
    pub id: UploadId,
    /// Where the bytes live on disk
    pub file_path: PathBuf,
    /// Name presented to the server
    pub file_name: String,
    /// Size in bytes at enqueue time
    pub size: u64,
    /// MIME type, if known
    pub mime_type: Option<String>,
    /// CRC32 of the contents (lowercase hex), if known
    pub checksum: Option<String>,
    /// When the item was queued
    pub enqueued_at: DateTime<Utc>,
    /// Current status
    pub status: UploadStatus,
    /// Failure count and next due time
    pub retry: RetryState,
    /// Message of the last failure
    pub last_error: Option<String>,
    /// Server-side id once completed
    pub remote_id: Option<String>,
}

impl QueuedUploadItem {
    pub(crate) fn from_new(upload: NewUpload, now: DateTime<Utc>) -> Self {
        Self {
            id: UploadId::new(),
            file_path: upload.file_path,
            file_name: upload.file_name,
            size: upload.size,
            mime_type: upload.mime_type,
            checksum: upload.checksum,
            enqueued_at: now,
            status: UploadStatus::Pending,
            retry: RetryState::default(),
            last_error: None,
            remote_id: None,
        }
    }

    /// Whether the queue should attempt this item at `now`
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == UploadStatus::Pending && self.retry.is_due(now)
    }
}

/// Request to queue a file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewUpload {
    /// Path of the file to send
    pub file_path: PathBuf,
    /// Name presented to the server
    pub file_name: String,
    /// Size in bytes
    pub size: u64,
    /// MIME type, if known
    pub mime_type: Option<String>,
    /// CRC32 checksum (lowercase hex), if known
    pub checksum: Option<String>,
}

impl NewUpload {
    /// Describe a file without touching the filesystem
    pub fn new(file_path: impl Into<PathBuf>, file_name: impl Into<String>, size: u64) -> Self {
        Self {
            file_path: file_path.into(),
            file_name: file_name.into(),
            size,
            mime_type: None,
            checksum: None,
        }
    }

    /// Set the MIME type
    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Set the checksum
    #[must_use]
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    /// Describe a file on disk: size from metadata, name from the path,
    /// MIME type from the extension and a CRC32 of the contents
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Storage`] if the file cannot be read.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, TetherError> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| io_error(path, &e))?;
        if !metadata.is_file() {
            return Err(TetherError::Storage(format!("{} is not a file", path.display())));
        }

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        Ok(Self {
            file_path: path.to_path_buf(),
            mime_type: guess_mime_type(&file_name).map(str::to_string),
            checksum: Some(crc32_file(path).await?),
            file_name,
            size: metadata.len(),
        })
    }
}

/// CRC32 of a file's contents as 8 lowercase hex digits
///
/// # Errors
///
/// Returns [`TetherError::Storage`] if the file cannot be read.
pub async fn crc32_file(path: &Path) -> Result<String, TetherError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| io_error(path, &e))?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf).await.map_err(|e| io_error(path, &e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize().to_be_bytes()))
}

fn io_error(path: &Path, err: &std::io::Error) -> TetherError {
    TetherError::Storage(format!("{}: {err}", path.display()))
}

fn guess_mime_type(file_name: &str) -> Option<&'static str> {
    let (_, ext) = file_name.rsplit_once('.')?;
    let mime = match ext.to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "zip" => "application/zip",
        _ => return None,
    };
    Some(mime)
}
