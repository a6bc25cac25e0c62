//! HTTP uploader

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use serde_json::Value;

use super::item::QueuedUploadItem;
use super::queue::{UploadReceipt, Uploader};
use crate::error::TetherError;
use crate::transport::{authorize, check_status, CredentialProvider};

/// Header carrying the CRC32 of the body
pub const CHECKSUM_HEADER: &str = "X-Checksum-CRC32";

/// Header carrying the original file name
pub const FILE_NAME_HEADER: &str = "X-File-Name";

/// `PUT`s file bytes to a fixed endpoint
#[derive(Clone)]
pub struct HttpUploader {
    client: reqwest::Client,
    endpoint: String,
    credentials: Option<Arc<dyn CredentialProvider>>,
    request_timeout: Duration,
}

impl HttpUploader {
    /// Create an uploader
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            credentials: None,
            request_timeout: Duration::from_secs(300),
        }
    }

    /// Attach a credential provider
    #[must_use]
    pub fn with_credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    /// Per-upload timeout
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, item: &QueuedUploadItem) -> Result<UploadReceipt, TetherError> {
        let bytes = tokio::fs::read(&item.file_path).await.map_err(|e| {
            TetherError::Storage(format!("{}: {e}", item.file_path.display()))
        })?;

        let mut builder = self
            .client
            .put(&self.endpoint)
            .timeout(self.request_timeout)
            .header(
                CONTENT_TYPE,
                item.mime_type.as_deref().unwrap_or("application/octet-stream"),
            )
            .header(FILE_NAME_HEADER, &item.file_name);
        if let Some(checksum) = &item.checksum {
            builder = builder.header(CHECKSUM_HEADER, checksum);
        }
        let builder = authorize(builder, self.credentials.as_ref()).await;

        tracing::debug!(upload_id = %item.id, bytes = bytes.len(), "Uploading file");
        let response = check_status(builder.body(bytes).send().await?).await?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;

        remote_id_from(&body, location.as_deref())
            .map(|remote_id| UploadReceipt { remote_id })
            .ok_or_else(|| TetherError::Parse("upload response carried no file id".into()))
    }
}

impl std::fmt::Debug for HttpUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpUploader")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Remote id from a JSON body `{"id": ..}`, else the last `Location` segment
fn remote_id_from(body: &str, location: Option<&str>) -> Option<String> {
    let from_body = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| match json.get("id")? {
            Value::String(id) => Some(id.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

    from_body.or_else(|| {
        location
            .and_then(|l| l.trim_end_matches('/').rsplit('/').next())
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
    })
}
