//! Restart Tests
//!
//! State written through [`FileStorage`] must be visible to a fresh process:
//! these tests drop every in-memory handle and reopen from the same directory.

use std::sync::Arc;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::mpsc;

use tether_core::registry::NoSubscription;
use tether_core::{
    FileStorage, LifecycleEvent, NewUpload, NoopHost, ProgressUpdate, QueuedUploadItem,
    RecoveryCallback, RecoveryConfig, RecoveryContext, RecoveryStore, RegistryConfig,
    SessionRegistry, Storage, StreamMetadata, TetherError, UploadConfig, UploadQueue,
    UploadStatus, Uploader,
};
use tether_core::upload::UploadReceipt;

struct NeverRecovers;

#[async_trait]
impl RecoveryCallback for NeverRecovers {
    async fn attempt_recovery(&self, _context: RecoveryContext) -> Result<(), TetherError> {
        Err(TetherError::Transport("offline".into()))
    }
}

struct OfflineUploader;

#[async_trait]
impl Uploader for OfflineUploader {
    async fn upload(&self, _item: &QueuedUploadItem) -> Result<UploadReceipt, TetherError> {
        Err(TetherError::Transport("offline".into()))
    }
}

fn storage(dir: &TempDir) -> Arc<dyn Storage> {
    Arc::new(FileStorage::new(dir.path()))
}

#[tokio::test]
async fn test_suspended_stream_survives_restart() {
    let dir = TempDir::new().unwrap();

    let stream_id = {
        let store = RecoveryStore::open(storage(&dir), RecoveryConfig::default())
            .await
            .unwrap();
        let registry = SessionRegistry::new(RegistryConfig::default(), Arc::new(NoopHost), Some(store));
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut metadata = StreamMetadata::new("conv-1".into(), "msg-1".into());
        metadata.last_event_id = Some("3".into());

        let id = registry.register(Box::new(NoSubscription), tx, Arc::new(NeverRecovers), metadata);
        registry.update_progress(
            id,
            ProgressUpdate::appended("Hello").with_event_id("5"),
        );
        registry.notify(LifecycleEvent::AboutToSuspend).await;
        id
    };

    let reopened = RecoveryStore::open(storage(&dir), RecoveryConfig::default())
        .await
        .unwrap();
    let records = reopened.recover_all();

    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.stream_id, stream_id);
    assert_eq!(record.metadata.last_content, "Hello");
    assert_eq!(record.metadata.last_event_id.as_deref(), Some("5"));
    assert!(record.metadata.suspended);
}

#[tokio::test]
async fn test_unregister_drops_snapshot() {
    let dir = TempDir::new().unwrap();
    let store = RecoveryStore::open(storage(&dir), RecoveryConfig::default())
        .await
        .unwrap();
    let registry = SessionRegistry::new(RegistryConfig::default(), Arc::new(NoopHost), Some(store));
    let (tx, _rx) = mpsc::unbounded_channel();

    let id = registry.register(
        Box::new(NoSubscription),
        tx,
        Arc::new(NeverRecovers),
        StreamMetadata::new("conv-1".into(), "msg-2".into()),
    );
    registry.persist_all().await.unwrap();
    assert!(registry.unregister(id).await);

    let reopened = RecoveryStore::open(storage(&dir), RecoveryConfig::default())
        .await
        .unwrap();
    assert!(reopened.is_empty());
}

#[tokio::test]
async fn test_upload_queue_survives_restart() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("photo.png");
    tokio::fs::write(&file, b"not really a png").await.unwrap();

    let id = {
        let queue = UploadQueue::open(storage(&dir), Arc::new(OfflineUploader), UploadConfig::default())
            .await
            .unwrap();
        let id = queue
            .enqueue(NewUpload::from_path(&file).await.unwrap())
            .await
            .unwrap();
        assert_eq!(queue.process_queue().await, 1);
        id
    };

    let queue = UploadQueue::open(storage(&dir), Arc::new(OfflineUploader), UploadConfig::default())
        .await
        .unwrap();
    let item = queue.get(id).unwrap();

    assert_eq!(queue.len(), 1);
    assert_eq!(item.status, UploadStatus::Pending);
    assert_eq!(item.file_name, "photo.png");
    assert_eq!(item.mime_type.as_deref(), Some("image/png"));
    assert_eq!(item.retry.attempt_count, 1);
    assert_eq!(item.last_error.as_deref(), Some("transport error: offline"));
}
