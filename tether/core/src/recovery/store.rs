//! Persisted recovery snapshots
//!
//! A write-through mirror of stream metadata used only after a process
//! restart. Lookups never override the live registry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::metadata::{RecoveryRecord, StreamMetadata};
use crate::error::TetherError;
use crate::ids::StreamId;
use crate::storage::{load_json, store_json, Storage};

/// Storage key for the serialized record list
pub const RECOVERY_KEY: &str = "tether.recovery";

/// Recovery store configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Records older than this are excluded from [`RecoveryStore::recover_all`]
    pub stale_threshold: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(60 * 60),
        }
    }
}

/// Persisted mirror of stream metadata
#[derive(Clone)]
pub struct RecoveryStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    storage: Arc<dyn Storage>,
    config: RecoveryConfig,
    records: DashMap<StreamId, StreamMetadata>,
    /// Serializes snapshot-and-write so an older snapshot never lands last
    write_lock: tokio::sync::Mutex<()>,
}

impl RecoveryStore {
    /// Open the store, loading whatever was persisted
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Storage`] if the persisted list cannot be read.
    pub async fn open(storage: Arc<dyn Storage>, config: RecoveryConfig) -> Result<Self, TetherError> {
        let records = DashMap::new();
        let persisted: Option<Vec<RecoveryRecord>> = load_json(storage.as_ref(), RECOVERY_KEY).await?;
        for record in persisted.unwrap_or_default() {
            records.insert(record.stream_id, record.metadata);
        }
        tracing::debug!(records = records.len(), "Recovery store opened");

        Ok(Self {
            inner: Arc::new(StoreInner {
                storage,
                config,
                records,
                write_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Store configuration
    #[must_use]
    pub fn config(&self) -> &RecoveryConfig {
        &self.inner.config
    }

    /// Save (replace) the snapshot for one stream
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Storage`] if persisting fails; the in-memory
    /// mirror is updated regardless.
    pub async fn save(&self, stream_id: StreamId, metadata: StreamMetadata) -> Result<(), TetherError> {
        self.inner.records.insert(stream_id, metadata);
        self.persist().await
    }

    /// Save several snapshots with a single write
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Storage`] if persisting fails.
    pub async fn save_many(
        &self,
        entries: impl IntoIterator<Item = (StreamId, StreamMetadata)>,
    ) -> Result<(), TetherError> {
        for (stream_id, metadata) in entries {
            self.inner.records.insert(stream_id, metadata);
        }
        self.persist().await
    }

    /// Look up one snapshot, stale or not
    #[must_use]
    pub fn load(&self, stream_id: StreamId) -> Option<StreamMetadata> {
        self.inner.records.get(&stream_id).map(|r| r.value().clone())
    }

    /// All snapshots that are still fresh enough to resume
    #[must_use]
    pub fn recover_all(&self) -> Vec<RecoveryRecord> {
        self.recover_all_at(Utc::now())
    }

    /// [`recover_all`](Self::recover_all) relative to a given time
    #[must_use]
    pub fn recover_all_at(&self, now: DateTime<Utc>) -> Vec<RecoveryRecord> {
        let mut fresh: Vec<RecoveryRecord> = self
            .inner
            .records
            .iter()
            .filter(|entry| !self.is_stale(entry.value(), now))
            .map(|entry| RecoveryRecord {
                stream_id: *entry.key(),
                metadata: entry.value().clone(),
            })
            .collect();
        fresh.sort_by_key(|r| r.metadata.last_update);
        fresh
    }

    /// Drop the snapshot for a stream
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Storage`] if persisting fails.
    pub async fn remove(&self, stream_id: StreamId) -> Result<bool, TetherError> {
        let removed = self.inner.records.remove(&stream_id).is_some();
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Whether a snapshot is too old to trust
    #[must_use]
    pub fn is_stale(&self, metadata: &StreamMetadata, now: DateTime<Utc>) -> bool {
        (now - metadata.last_update)
            .to_std()
            .is_ok_and(|age| age > self.inner.config.stale_threshold)
    }

    /// Number of snapshots held, stale included
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.records.len()
    }

    /// Whether no snapshots are held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.records.is_empty()
    }

    async fn persist(&self) -> Result<(), TetherError> {
        let _guard = self.inner.write_lock.lock().await;
        let records: Vec<RecoveryRecord> = self
            .inner
            .records
            .iter()
            .map(|entry| RecoveryRecord {
                stream_id: *entry.key(),
                metadata: entry.value().clone(),
            })
            .collect();
        store_json(self.inner.storage.as_ref(), RECOVERY_KEY, &records).await?;
        Ok(())
    }
}

impl std::fmt::Debug for RecoveryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryStore")
            .field("records", &self.inner.records.len())
            .field("config", &self.inner.config)
            .finish()
    }
}
