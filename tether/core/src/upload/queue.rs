//! Upload Queue
//!
//! Durable work queue for attachments. The whole queue is written to storage
//! after every mutation, so a restart resumes where it left off without
//! re-sending completed files.
//!
//! Draining is serialized by a re-entrancy flag: a `process_queue` call that
//! finds another drain running returns immediately. The scheduler task drains
//! on a fixed tick and whenever an item is enqueued or re-armed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::BroadcastStream;

use super::item::{NewUpload, QueuedUploadItem, UploadStatus};
use crate::error::TetherError;
use crate::ids::UploadId;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::storage::{load_json, store_json, Storage};

/// Storage key for the serialized queue
pub const UPLOADS_KEY: &str = "tether.uploads";

/// Buffered change notifications per subscriber
const CHANGE_CAPACITY: usize = 256;

/// Upload queue configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Scheduler drain period
    pub tick_interval: Duration,
    /// Backoff between attempts of one item
    pub retry: RetryPolicy,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            retry: RetryPolicy {
                max_attempts: 4,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(60),
                max_jitter: Duration::from_secs(1),
            },
        }
    }
}

/// Server acknowledgement of an upload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Server-side id of the stored file
    pub remote_id: String,
}

/// Sends one file to the server
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload the item's bytes
    async fn upload(&self, item: &QueuedUploadItem) -> Result<UploadReceipt, TetherError>;
}

/// Change notification for observers (badges, retry buttons)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueChange {
    /// Item added
    Enqueued(UploadId),
    /// Upload call started
    Started(UploadId),
    /// Server accepted the file
    Completed {
        /// Item id
        id: UploadId,
        /// Server-side id
        remote_id: String,
    },
    /// Attempt failed; the item is pending again
    RetryScheduled {
        /// Item id
        id: UploadId,
        /// Failures so far
        attempt: u32,
        /// When the next attempt becomes due
        next_retry_at: DateTime<Utc>,
    },
    /// Item gave up; needs a manual retry
    Failed {
        /// Item id
        id: UploadId,
        /// Last error message
        error: String,
    },
    /// Item re-armed by [`UploadQueue::retry`]
    Requeued(UploadId),
    /// Item cancelled
    Cancelled(UploadId),
    /// Item removed
    Removed(UploadId),
}

struct QueueInner {
    storage: Arc<dyn Storage>,
    uploader: Arc<dyn Uploader>,
    config: UploadConfig,
    items: Mutex<Vec<QueuedUploadItem>>,
    draining: AtomicBool,
    kick: Arc<Notify>,
    changes: broadcast::Sender<QueueChange>,
    write_lock: tokio::sync::Mutex<()>,
}

/// Durable upload queue
///
/// Cloning is cheap; clones share the same queue.
#[derive(Clone)]
pub struct UploadQueue {
    inner: Arc<QueueInner>,
}

/// Clears the drain flag when a drain ends, including by panic
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl UploadQueue {
    /// Open the queue, restoring persisted items
    ///
    /// Items persisted as `uploading` were interrupted mid-flight and are
    /// restored as `pending`.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Storage`] if the persisted queue cannot be read
    /// or the restored state cannot be written back.
    pub async fn open(
        storage: Arc<dyn Storage>,
        uploader: Arc<dyn Uploader>,
        config: UploadConfig,
    ) -> Result<Self, TetherError> {
        let mut items: Vec<QueuedUploadItem> =
            load_json(storage.as_ref(), UPLOADS_KEY).await?.unwrap_or_default();

        let mut interrupted = 0usize;
        for item in items.iter_mut().filter(|i| i.status == UploadStatus::Uploading) {
            item.status = UploadStatus::Pending;
            interrupted += 1;
        }

        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        let queue = Self {
            inner: Arc::new(QueueInner {
                storage,
                uploader,
                config,
                items: Mutex::new(items),
                draining: AtomicBool::new(false),
                kick: Arc::new(Notify::new()),
                changes,
                write_lock: tokio::sync::Mutex::new(()),
            }),
        };

        if interrupted > 0 {
            tracing::info!(interrupted, "Resuming interrupted uploads");
            queue.persist().await?;
        }
        tracing::debug!(items = queue.len(), "Upload queue opened");
        Ok(queue)
    }

    /// Queue configuration
    #[must_use]
    pub fn config(&self) -> &UploadConfig {
        &self.inner.config
    }

    /// Add a file to the queue and wake the scheduler
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Storage`] if the queue cannot be persisted.
    pub async fn enqueue(&self, upload: NewUpload) -> Result<UploadId, TetherError> {
        let item = QueuedUploadItem::from_new(upload, Utc::now());
        let id = item.id;
        tracing::info!(upload_id = %id, file_name = %item.file_name, size = item.size, "Upload enqueued");

        self.inner.items.lock().push(item);
        self.persist().await?;
        self.publish(QueueChange::Enqueued(id));
        self.inner.kick.notify_one();
        Ok(id)
    }

    /// Upload every due item, oldest first
    ///
    /// Returns the number of upload attempts made. Returns 0 without doing
    /// anything if another drain is already running.
    pub async fn process_queue(&self) -> usize {
        if self.inner.draining.swap(true, Ordering::AcqRel) {
            tracing::debug!("Upload drain already running");
            return 0;
        }
        let _guard = DrainGuard(&self.inner.draining);

        let mut attempts = 0usize;
        while let Some(item) = self.claim_next(Utc::now()) {
            self.persist_best_effort().await;
            self.publish(QueueChange::Started(item.id));

            let result = self.inner.uploader.upload(&item).await;
            if let Some(change) = self.record_result(item.id, result) {
                self.persist_best_effort().await;
                self.publish(change);
            }
            attempts += 1;
        }
        attempts
    }

    /// Re-arm a failed, cancelled or pending item with a fresh retry budget
    ///
    /// # Errors
    ///
    /// [`TetherError::NotFound`] for an unknown id; [`TetherError::Storage`]
    /// if persisting fails.
    pub async fn retry(&self, id: UploadId) -> Result<(), TetherError> {
        {
            let mut items = self.inner.items.lock();
            let item = find_mut(&mut items, id)?;
            match item.status {
                UploadStatus::Completed | UploadStatus::Uploading => return Ok(()),
                UploadStatus::Pending | UploadStatus::Failed | UploadStatus::Cancelled => {
                    item.status = UploadStatus::Pending;
                    item.retry.reset();
                    item.last_error = None;
                }
            }
        }
        tracing::info!(upload_id = %id, "Upload re-armed");
        self.persist().await?;
        self.publish(QueueChange::Requeued(id));
        self.inner.kick.notify_one();
        Ok(())
    }

    /// Cancel an item; completed items are left alone
    ///
    /// An upload already in flight finishes but its result is discarded.
    ///
    /// # Errors
    ///
    /// [`TetherError::NotFound`] for an unknown id; [`TetherError::Storage`]
    /// if persisting fails.
    pub async fn cancel(&self, id: UploadId) -> Result<(), TetherError> {
        {
            let mut items = self.inner.items.lock();
            let item = find_mut(&mut items, id)?;
            if matches!(item.status, UploadStatus::Completed | UploadStatus::Cancelled) {
                return Ok(());
            }
            item.status = UploadStatus::Cancelled;
            item.retry.next_retry_at = None;
        }
        tracing::info!(upload_id = %id, "Upload cancelled");
        self.persist().await?;
        self.publish(QueueChange::Cancelled(id));
        Ok(())
    }

    /// Remove an item regardless of status
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Storage`] if persisting fails.
    pub async fn remove(&self, id: UploadId) -> Result<bool, TetherError> {
        self.remove_where(|item| item.id == id).await.map(|n| n > 0)
    }

    /// Remove a completed item once the caller has taken its remote id
    ///
    /// Returns `false` if the item is unknown or not completed.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Storage`] if persisting fails.
    pub async fn acknowledge(&self, id: UploadId) -> Result<bool, TetherError> {
        self.remove_where(|item| item.id == id && item.status == UploadStatus::Completed)
            .await
            .map(|n| n > 0)
    }

    /// Remove failed and cancelled items
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Storage`] if persisting fails.
    pub async fn clear_failed(&self) -> Result<usize, TetherError> {
        self.remove_where(|item| {
            matches!(item.status, UploadStatus::Failed | UploadStatus::Cancelled)
        })
        .await
    }

    /// Remove everything
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Storage`] if persisting fails.
    pub async fn clear_all(&self) -> Result<usize, TetherError> {
        self.remove_where(|_| true).await
    }

    /// Copy of one item
    #[must_use]
    pub fn get(&self, id: UploadId) -> Option<QueuedUploadItem> {
        self.inner.items.lock().iter().find(|i| i.id == id).cloned()
    }

    /// Copy of the whole queue in enqueue order
    #[must_use]
    pub fn items(&self) -> Vec<QueuedUploadItem> {
        self.inner.items.lock().clone()
    }

    /// Number of queued items
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    /// Whether the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.items.lock().is_empty()
    }

    /// Stream of changes from now on
    ///
    /// A slow observer that falls behind sees a lag error item instead of
    /// the missed changes.
    #[must_use]
    pub fn changes(&self) -> BroadcastStream<QueueChange> {
        BroadcastStream::new(self.inner.changes.subscribe())
    }

    /// Drain on every tick and whenever work is added
    ///
    /// The task exits once every clone of the queue is dropped.
    pub fn spawn_scheduler(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let kick = Arc::clone(&self.inner.kick);
        let period = self.inner.config.tick_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = kick.notified() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let attempts = UploadQueue { inner }.process_queue().await;
                if attempts > 0 {
                    tracing::debug!(attempts, "Upload drain finished");
                }
            }
        })
    }

    /// Mark the oldest due item as uploading and return a copy
    fn claim_next(&self, now: DateTime<Utc>) -> Option<QueuedUploadItem> {
        let mut items = self.inner.items.lock();
        let item = items.iter_mut().find(|i| i.is_due(now))?;
        item.status = UploadStatus::Uploading;
        Some(item.clone())
    }

    fn record_result(
        &self,
        id: UploadId,
        result: Result<UploadReceipt, TetherError>,
    ) -> Option<QueueChange> {
        let mut items = self.inner.items.lock();
        let Some(item) = items.iter_mut().find(|i| i.id == id) else {
            tracing::debug!(upload_id = %id, "Upload finished after removal, result discarded");
            return None;
        };
        if item.status != UploadStatus::Uploading {
            tracing::debug!(upload_id = %id, status = %item.status, "Upload result discarded");
            return None;
        }

        let error = match result {
            Ok(receipt) => {
                tracing::info!(upload_id = %id, remote_id = %receipt.remote_id, "Upload completed");
                item.status = UploadStatus::Completed;
                item.retry.reset();
                item.last_error = None;
                item.remote_id = Some(receipt.remote_id.clone());
                return Some(QueueChange::Completed {
                    id,
                    remote_id: receipt.remote_id,
                });
            }
            Err(error) => error,
        };

        item.last_error = Some(error.to_string());
        if !error.is_retryable() {
            tracing::warn!(upload_id = %id, error = %error, "Upload failed");
            item.status = UploadStatus::Failed;
            item.retry.next_retry_at = None;
            return Some(QueueChange::Failed {
                id,
                error: error.to_string(),
            });
        }

        match item.retry.record_failure(&self.inner.config.retry, Utc::now()) {
            RetryDecision::Retry { attempt, .. } => {
                item.status = UploadStatus::Pending;
                let next_retry_at = item.retry.next_retry_at.unwrap_or_else(Utc::now);
                tracing::warn!(upload_id = %id, attempt, error = %error, "Upload attempt failed, retrying");
                Some(QueueChange::RetryScheduled {
                    id,
                    attempt,
                    next_retry_at,
                })
            }
            RetryDecision::Exhausted { attempts } => {
                tracing::warn!(upload_id = %id, attempts, error = %error, "Upload attempts exhausted");
                item.status = UploadStatus::Failed;
                Some(QueueChange::Failed {
                    id,
                    error: error.to_string(),
                })
            }
        }
    }

    async fn remove_where(
        &self,
        predicate: impl Fn(&QueuedUploadItem) -> bool,
    ) -> Result<usize, TetherError> {
        let removed: Vec<UploadId> = {
            let mut items = self.inner.items.lock();
            let (gone, kept): (Vec<_>, Vec<_>) = items.drain(..).partition(|i| predicate(i));
            *items = kept;
            gone.into_iter().map(|i| i.id).collect()
        };
        if removed.is_empty() {
            return Ok(0);
        }

        self.persist().await?;
        for id in &removed {
            tracing::debug!(upload_id = %id, "Upload removed");
            self.publish(QueueChange::Removed(*id));
        }
        Ok(removed.len())
    }

    fn publish(&self, change: QueueChange) {
        // No subscribers is fine.
        let _ = self.inner.changes.send(change);
    }

    async fn persist(&self) -> Result<(), TetherError> {
        let _guard = self.inner.write_lock.lock().await;
        let snapshot = self.inner.items.lock().clone();
        store_json(self.inner.storage.as_ref(), UPLOADS_KEY, &snapshot).await?;
        Ok(())
    }

    async fn persist_best_effort(&self) {
        if let Err(e) = self.persist().await {
            tracing::warn!(error = %e, "Failed to persist upload queue");
        }
    }
}

fn find_mut(items: &mut [QueuedUploadItem], id: UploadId) -> Result<&mut QueuedUploadItem, TetherError> {
    items
        .iter_mut()
        .find(|i| i.id == id)
        .ok_or_else(|| TetherError::NotFound(id.to_string()))
}

impl std::fmt::Debug for UploadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadQueue")
            .field("items", &self.len())
            .field("draining", &self.inner.draining.load(Ordering::Relaxed))
            .field("config", &self.inner.config)
            .finish()
    }
}
