//! Session Registry - Stream Lifecycle Coordination
//!
//! Tracks every live stream, reacts to host lifecycle signals and drives
//! recovery with exponential backoff.
//!
//! # Architecture
//!
//! ```text
//!   host signals ──► notify() ─┐
//!   transport ─► report_failure()├─► Mutex<RegistryState> ──► per-stream task
//!   monitor ──► recover_stalled()┘     │                        (attempt / backoff)
//!                                      ▼
//!                          wake lock + background grant
//!                          (acquired on first stream,
//!                           released after the last)
//! ```
//!
//! # State machine
//!
//! ```text
//!   Active ──lost──► Suspended ──trigger──► Recovering ──ok──► Active
//!                                              │  ▲
//!                                   retryable  │  │ backoff elapsed
//!                                              ▼  │
//!                                          (retry scheduled)
//!                                              │
//!                            exhausted / non-retryable ──► Failed (removed)
//! ```
//!
//! Every attempt is tagged with the stream's epoch. Suspending, unregistering
//! or starting a newer attempt bumps the epoch, so results from superseded
//! attempts are discarded instead of racing the current one.
//!
//! The registry lock is a `parking_lot` mutex and is never held across an
//! `.await`. Methods that start recovery spawn Tokio tasks and therefore must
//! be called from within a runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::host::{HostCapabilities, Subscription};
use super::lifecycle::{
    AppState, LifecycleEvent, ProgressUpdate, RecoveryCallback, RecoveryContext, StreamNotice,
    StreamState,
};
use crate::error::TetherError;
use crate::ids::StreamId;
use crate::recovery::{ContentChange, ContentUpdate, RecoveryStore, StreamMetadata};
use crate::retry::{RetryDecision, RetryPolicy, RetryState};

/// Registry configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Backoff for recovery attempts
    pub retry: RetryPolicy,
    /// An active stream with no progress for this long is treated as stalled
    pub inactivity_threshold: Duration,
    /// How often the inactivity monitor checks for stalled streams
    pub monitor_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            inactivity_threshold: Duration::from_secs(120),
            monitor_interval: Duration::from_secs(15),
        }
    }
}

/// Point-in-time counters for diagnostics
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RegistrySummary {
    /// Streams receiving data
    pub active: usize,
    /// Streams waiting for a recovery trigger
    pub suspended: usize,
    /// Streams with an attempt running or scheduled
    pub recovering: usize,
    /// Host visibility
    pub app_state: AppState,
    /// Last known connectivity
    pub online: bool,
    /// Whether the wake lock is held
    pub wake_lock_held: bool,
    /// Whether background execution is granted
    pub background_granted: bool,
    /// Streams registered since creation
    pub total_registered: u64,
    /// Streams that failed terminally since creation
    pub total_failed: u64,
}

struct StreamEntry {
    metadata: StreamMetadata,
    state: StreamState,
    retry: RetryState,
    epoch: u64,
    subscription: Box<dyn Subscription>,
    progress: mpsc::UnboundedSender<StreamNotice>,
    recovery: Arc<dyn RecoveryCallback>,
    /// Running attempt or pending backoff timer
    pending: Option<JoinHandle<()>>,
    /// Failure reported while the running attempt was still in flight
    interrupted: Option<TetherError>,
}

impl StreamEntry {
    fn notify(&self, notice: StreamNotice) {
        // The owner may have stopped listening; the stream is still tracked.
        let _ = self.progress.send(notice);
    }

    fn cancel_pending(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }

    /// Drop the transport and wait for a trigger. Returns false if already suspended.
    fn suspend(&mut self, now: DateTime<Utc>) -> bool {
        if self.state == StreamState::Suspended {
            return false;
        }
        self.cancel_pending();
        self.epoch += 1;
        self.subscription.cancel();
        self.state = StreamState::Suspended;
        self.metadata.mark_suspended(now);
        self.notify(StreamNotice::Suspended);
        true
    }

    fn is_stalled(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.state == StreamState::Active
            && (now - self.metadata.last_update)
                .to_std()
                .is_ok_and(|idle| idle > threshold)
    }
}

struct RegistryState {
    streams: HashMap<StreamId, StreamEntry>,
    app_state: AppState,
    online: bool,
    wake_lock_held: bool,
    background_granted: bool,
    total_registered: u64,
    total_failed: u64,
}

impl RegistryState {
    fn can_recover(&self) -> bool {
        self.online && (self.app_state == AppState::Foreground || self.background_granted)
    }

    fn ids_where(&self, predicate: impl Fn(&StreamEntry) -> bool) -> Vec<StreamId> {
        self.streams
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(id, _)| *id)
            .collect()
    }
}

struct RegistryInner {
    config: RegistryConfig,
    host: Arc<dyn HostCapabilities>,
    store: Option<RecoveryStore>,
    state: Mutex<RegistryState>,
}

/// Thread-safe registry of live streams
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// Create a registry
    ///
    /// With a [`RecoveryStore`], snapshots are written on background and
    /// suspend signals and removed when streams end.
    pub fn new(
        config: RegistryConfig,
        host: Arc<dyn HostCapabilities>,
        store: Option<RecoveryStore>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                host,
                store,
                state: Mutex::new(RegistryState {
                    streams: HashMap::new(),
                    app_state: AppState::Foreground,
                    online: true,
                    wake_lock_held: false,
                    background_granted: false,
                    total_registered: 0,
                    total_failed: 0,
                }),
            }),
        }
    }

    /// Registry configuration
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// The recovery store, if one was supplied
    #[must_use]
    pub fn recovery_store(&self) -> Option<&RecoveryStore> {
        self.inner.store.as_ref()
    }

    /// Start tracking a stream
    ///
    /// The first registration acquires the wake lock. Registering while
    /// backgrounded requests background execution if it is not yet granted.
    pub fn register(
        &self,
        subscription: Box<dyn Subscription>,
        progress: mpsc::UnboundedSender<StreamNotice>,
        recovery: Arc<dyn RecoveryCallback>,
        metadata: StreamMetadata,
    ) -> StreamId {
        let id = StreamId::new();
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        if !state.wake_lock_held {
            self.inner.host.acquire_wake_lock();
            state.wake_lock_held = true;
            tracing::debug!("Wake lock acquired");
        }
        if state.app_state == AppState::Background && !state.background_granted {
            state.background_granted = self.inner.host.begin_background_execution();
        }

        tracing::info!(
            stream_id = %id,
            conversation_id = %metadata.conversation_id,
            message_id = %metadata.message_id,
            "Stream registered"
        );

        state.streams.insert(
            id,
            StreamEntry {
                metadata,
                state: StreamState::Active,
                retry: RetryState::default(),
                epoch: 0,
                subscription,
                progress,
                recovery,
                pending: None,
                interrupted: None,
            },
        );
        state.total_registered += 1;
        id
    }

    /// Stop tracking a stream, cancelling its transport and pending retries
    ///
    /// Returns `false` if the id was unknown. Releasing the last stream
    /// releases the wake lock and background execution.
    pub async fn unregister(&self, id: StreamId) -> bool {
        let removed = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            match state.streams.remove(&id) {
                Some(mut entry) => {
                    entry.cancel_pending();
                    entry.subscription.cancel();
                    self.release_if_idle(state);
                    true
                }
                None => false,
            }
        };

        if removed {
            tracing::info!(stream_id = %id, "Stream unregistered");
            if let Some(store) = &self.inner.store {
                if let Err(e) = store.remove(id).await {
                    tracing::warn!(stream_id = %id, error = %e, "Failed to drop recovery snapshot");
                }
            }
        }
        removed
    }

    /// Apply transport progress to a stream's metadata
    ///
    /// A snapshot in `content` is applied before `appended_content`. Returns
    /// the combined effect on the accumulated text, or `None` for an unknown
    /// stream.
    pub fn update_progress(&self, id: StreamId, update: ProgressUpdate) -> Option<ContentChange> {
        let mut guard = self.inner.state.lock();
        let entry = guard.streams.get_mut(&id)?;
        let metadata = &mut entry.metadata;

        let mut change = ContentChange::Unchanged;
        if let Some(snapshot) = update.content {
            change = metadata.apply_content(ContentUpdate::Snapshot(snapshot));
        }
        if let Some(delta) = update.appended_content {
            let appended = metadata.apply_content(ContentUpdate::Append(delta));
            change = match (change, appended) {
                (ContentChange::Appended { delta: mut first }, ContentChange::Appended { delta }) => {
                    first.push_str(&delta);
                    ContentChange::Appended { delta: first }
                }
                (ContentChange::Unchanged, next) => next,
                (previous, _) => previous,
            };
        }
        if let Some(sequence) = update.chunk_sequence {
            metadata.last_chunk_sequence = sequence;
        }
        if let Some(event_id) = update.last_event_id {
            metadata.last_event_id = Some(event_id);
        }
        metadata.mark_resumed(Utc::now());

        Some(change)
    }

    /// Whether the stream is still tracked
    #[must_use]
    pub fn is_active(&self, id: StreamId) -> bool {
        self.inner.state.lock().streams.contains_key(&id)
    }

    /// Current lifecycle state of a stream
    #[must_use]
    pub fn state(&self, id: StreamId) -> Option<StreamState> {
        self.inner.state.lock().streams.get(&id).map(|e| e.state)
    }

    /// Copy of a stream's metadata
    #[must_use]
    pub fn metadata(&self, id: StreamId) -> Option<StreamMetadata> {
        self.inner
            .state
            .lock()
            .streams
            .get(&id)
            .map(|e| e.metadata.clone())
    }

    /// Start a recovery attempt now, resetting the backoff
    ///
    /// Runs even while offline or backgrounded. Returns `false` for an
    /// unknown stream.
    pub fn force_recover(&self, id: StreamId) -> bool {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let Some(entry) = state.streams.get_mut(&id) else {
            return false;
        };
        entry.retry.reset();
        tracing::info!(stream_id = %id, "Forced recovery");
        self.begin_recovery(state, id);
        true
    }

    /// Report that a stream's transport broke
    ///
    /// Non-retryable errors fail the stream immediately. Retryable ones start
    /// recovery if the app may run and the network is up, otherwise the
    /// stream is suspended until a lifecycle trigger arrives. A report for a
    /// stream that is already recovering is held until the attempt finishes,
    /// which then counts as failed.
    pub fn report_failure(&self, id: StreamId, error: TetherError) {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let can_recover = state.can_recover();
        let Some(entry) = state.streams.get_mut(&id) else {
            return;
        };

        if !error.is_retryable() {
            self.fail(state, id, error);
            return;
        }
        if entry.state == StreamState::Recovering {
            tracing::debug!(stream_id = %id, error = %error, "Failure during recovery attempt");
            entry.interrupted = Some(error);
            return;
        }

        tracing::warn!(stream_id = %id, error = %error, "Stream transport lost");
        if can_recover {
            self.begin_recovery(state, id);
        } else {
            entry.suspend(Utc::now());
        }
    }

    /// Forward a host lifecycle signal
    pub async fn notify(&self, event: LifecycleEvent) {
        tracing::info!(event = ?event, "Lifecycle event");
        match event {
            LifecycleEvent::Background => {
                self.enter_background();
                self.persist_best_effort().await;
            }
            LifecycleEvent::Foreground => self.enter_foreground(),
            LifecycleEvent::AboutToSuspend => {
                self.prepare_for_suspension();
                self.persist_best_effort().await;
            }
            LifecycleEvent::ConnectivityLost => {
                let mut guard = self.inner.state.lock();
                guard.online = false;
                let now = Utc::now();
                for entry in guard.streams.values_mut() {
                    entry.suspend(now);
                }
            }
            LifecycleEvent::ConnectivityRestored => {
                let mut guard = self.inner.state.lock();
                let state = &mut *guard;
                state.online = true;
                if state.can_recover() {
                    self.recover_waiting(state);
                }
            }
        }
    }

    /// Recover active streams that have gone quiet for too long
    ///
    /// Returns how many recoveries were started.
    pub fn recover_stalled(&self) -> usize {
        self.recover_stalled_at(Utc::now())
    }

    /// [`recover_stalled`](Self::recover_stalled) relative to a given time
    pub fn recover_stalled_at(&self, now: DateTime<Utc>) -> usize {
        let threshold = self.inner.config.inactivity_threshold;
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if !state.can_recover() {
            return 0;
        }

        let stalled = state.ids_where(|entry| entry.is_stalled(now, threshold));
        for id in &stalled {
            if let Some(entry) = state.streams.get_mut(id) {
                tracing::warn!(stream_id = %id, "Stream stalled");
                entry.metadata.mark_suspended(now);
            }
            self.begin_recovery(state, *id);
        }
        stalled.len()
    }

    /// Periodically run [`recover_stalled`](Self::recover_stalled)
    ///
    /// The task exits once every clone of the registry is dropped.
    pub fn spawn_inactivity_monitor(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.monitor_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let recovered = SessionRegistry { inner }.recover_stalled();
                if recovered > 0 {
                    tracing::debug!(recovered, "Inactivity monitor started recoveries");
                }
            }
        })
    }

    /// Write every stream's metadata to the recovery store
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Storage`] if the snapshot cannot be written.
    pub async fn persist_all(&self) -> Result<(), TetherError> {
        let Some(store) = &self.inner.store else {
            return Ok(());
        };
        let snapshot: Vec<(StreamId, StreamMetadata)> = self
            .inner
            .state
            .lock()
            .streams
            .iter()
            .map(|(id, entry)| (*id, entry.metadata.clone()))
            .collect();
        if snapshot.is_empty() {
            return Ok(());
        }
        tracing::debug!(streams = snapshot.len(), "Persisting stream metadata");
        store.save_many(snapshot).await
    }

    /// Current counters
    #[must_use]
    pub fn summary(&self) -> RegistrySummary {
        let guard = self.inner.state.lock();
        let count = |wanted: StreamState| guard.streams.values().filter(|e| e.state == wanted).count();
        RegistrySummary {
            active: count(StreamState::Active),
            suspended: count(StreamState::Suspended),
            recovering: count(StreamState::Recovering),
            app_state: guard.app_state,
            online: guard.online,
            wake_lock_held: guard.wake_lock_held,
            background_granted: guard.background_granted,
            total_registered: guard.total_registered,
            total_failed: guard.total_failed,
        }
    }

    /// Number of tracked streams
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().streams.len()
    }

    /// Whether no streams are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().streams.is_empty()
    }

    fn enter_background(&self) {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        state.app_state = AppState::Background;
        if state.streams.is_empty() || state.background_granted {
            return;
        }

        state.background_granted = self.inner.host.begin_background_execution();
        if !state.background_granted {
            tracing::warn!("Background execution denied, suspending streams");
            let now = Utc::now();
            for entry in state.streams.values_mut() {
                entry.suspend(now);
            }
        }
    }

    fn enter_foreground(&self) {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        state.app_state = AppState::Foreground;
        if state.background_granted {
            self.inner.host.end_background_execution();
            state.background_granted = false;
        }
        if state.can_recover() {
            self.recover_waiting(state);
        }
    }

    fn prepare_for_suspension(&self) {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let now = Utc::now();
        for entry in state.streams.values_mut() {
            entry.suspend(now);
        }
        if state.background_granted {
            self.inner.host.end_background_execution();
            state.background_granted = false;
        }
    }

    async fn persist_best_effort(&self) {
        if let Err(e) = self.persist_all().await {
            tracing::warn!(error = %e, "Failed to persist stream metadata");
        }
    }

    /// Recover suspended streams and active ones that stalled
    fn recover_waiting(&self, state: &mut RegistryState) {
        let now = Utc::now();
        let threshold = self.inner.config.inactivity_threshold;
        let waiting = state.ids_where(|entry| {
            entry.state == StreamState::Suspended || entry.is_stalled(now, threshold)
        });
        for id in waiting {
            self.begin_recovery(state, id);
        }
    }

    fn begin_recovery(&self, state: &mut RegistryState, id: StreamId) {
        let Some(entry) = state.streams.get_mut(&id) else {
            return;
        };
        entry.cancel_pending();
        entry.subscription.cancel();
        entry.epoch += 1;
        entry.state = StreamState::Recovering;
        entry.interrupted = None;

        let attempt = entry.retry.attempt_count + 1;
        let epoch = entry.epoch;
        let context = RecoveryContext {
            stream_id: id,
            attempt,
            metadata: entry.metadata.clone(),
        };
        let callback = Arc::clone(&entry.recovery);
        entry.notify(StreamNotice::Recovering { attempt });
        tracing::info!(stream_id = %id, attempt, "Recovery attempt started");

        let registry = self.clone();
        entry.pending = Some(tokio::spawn(async move {
            let result = callback.attempt_recovery(context).await;
            registry.finish_attempt(id, epoch, result);
        }));
    }

    fn finish_attempt(&self, id: StreamId, epoch: u64, result: Result<(), TetherError>) {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let Some(entry) = state.streams.get_mut(&id) else {
            return;
        };
        if entry.epoch != epoch || entry.state != StreamState::Recovering {
            tracing::debug!(stream_id = %id, "Superseded recovery result discarded");
            return;
        }
        entry.pending = None;

        // The new transport broke before the attempt reported back.
        let result = match (result, entry.interrupted.take()) {
            (Ok(()), Some(error)) => Err(error),
            (result, _) => result,
        };

        let error = match result {
            Ok(()) => {
                entry.state = StreamState::Active;
                entry.retry.reset();
                entry.metadata.mark_resumed(Utc::now());
                entry.notify(StreamNotice::Recovered);
                tracing::info!(stream_id = %id, "Stream recovered");
                return;
            }
            Err(error) => error,
        };

        if !error.is_retryable() {
            self.fail(state, id, error);
            return;
        }

        match entry.retry.record_failure(&self.inner.config.retry, Utc::now()) {
            RetryDecision::Retry { attempt, delay } => {
                tracing::warn!(
                    stream_id = %id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Recovery attempt failed, retrying"
                );
                entry.notify(StreamNotice::RetryScheduled { attempt, delay });
                let registry = self.clone();
                entry.pending = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    registry.retry_due(id, epoch);
                }));
            }
            RetryDecision::Exhausted { attempts } => {
                tracing::warn!(stream_id = %id, attempts, error = %error, "Recovery attempts exhausted");
                self.fail(state, id, TetherError::RetriesExhausted { attempts });
            }
        }
    }

    fn retry_due(&self, id: StreamId, epoch: u64) {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let can_recover = state.can_recover();
        let Some(entry) = state.streams.get_mut(&id) else {
            return;
        };
        if entry.epoch != epoch || entry.state != StreamState::Recovering {
            return;
        }
        entry.pending = None;

        if can_recover {
            self.begin_recovery(state, id);
        } else {
            entry.suspend(Utc::now());
        }
    }

    /// Remove a stream after a terminal error, notifying its owner once
    fn fail(&self, state: &mut RegistryState, id: StreamId, error: TetherError) {
        let Some(mut entry) = state.streams.remove(&id) else {
            return;
        };
        entry.cancel_pending();
        entry.subscription.cancel();
        tracing::error!(stream_id = %id, error = %error, "Stream failed");
        entry.notify(StreamNotice::Failed(error));
        state.total_failed += 1;
        self.release_if_idle(state);

        if let Some(store) = self.inner.store.clone() {
            tokio::spawn(async move {
                if let Err(e) = store.remove(id).await {
                    tracing::warn!(stream_id = %id, error = %e, "Failed to drop recovery snapshot");
                }
            });
        }
    }

    fn release_if_idle(&self, state: &mut RegistryState) {
        if !state.streams.is_empty() {
            return;
        }
        if state.wake_lock_held {
            self.inner.host.release_wake_lock();
            state.wake_lock_held = false;
            tracing::debug!("Wake lock released");
        }
        if state.background_granted {
            self.inner.host.end_background_execution();
            state.background_granted = false;
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("summary", &self.summary())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NoSubscription;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct RecordingHost {
        deny_background: AtomicBool,
        wake_acquired: AtomicU32,
        wake_released: AtomicU32,
        background_begun: AtomicU32,
        background_ended: AtomicU32,
    }

    impl HostCapabilities for RecordingHost {
        fn acquire_wake_lock(&self) {
            self.wake_acquired.fetch_add(1, Ordering::SeqCst);
        }

        fn release_wake_lock(&self) {
            self.wake_released.fetch_add(1, Ordering::SeqCst);
        }

        fn begin_background_execution(&self) -> bool {
            self.background_begun.fetch_add(1, Ordering::SeqCst);
            !self.deny_background.load(Ordering::SeqCst)
        }

        fn end_background_execution(&self) {
            self.background_ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct ScriptedRecovery {
        outcomes: Mutex<VecDeque<Result<(), TetherError>>>,
        calls: AtomicU32,
    }

    impl ScriptedRecovery {
        fn with(outcomes: Vec<Result<(), TetherError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RecoveryCallback for ScriptedRecovery {
        async fn attempt_recovery(&self, _context: RecoveryContext) -> Result<(), TetherError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes.lock().pop_front().unwrap_or(Ok(()))
        }
    }

    struct FlagSubscription(Arc<AtomicBool>);

    impl Subscription for FlagSubscription {
        fn cancel(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn config() -> RegistryConfig {
        RegistryConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(30),
                max_jitter: Duration::ZERO,
            },
            ..Default::default()
        }
    }

    fn registry(host: &Arc<RecordingHost>) -> SessionRegistry {
        SessionRegistry::new(config(), host.clone(), None)
    }

    fn register(
        registry: &SessionRegistry,
        recovery: Arc<ScriptedRecovery>,
    ) -> (StreamId, mpsc::UnboundedReceiver<StreamNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = registry.register(
            Box::new(NoSubscription),
            tx,
            recovery,
            StreamMetadata::new("conv".into(), "msg".into()),
        );
        (id, rx)
    }

    fn transport_error() -> TetherError {
        TetherError::Transport("connection reset".into())
    }

    #[tokio::test]
    async fn test_wake_lock_reference_counted() {
        let host = Arc::new(RecordingHost::default());
        let registry = registry(&host);

        let ids: Vec<StreamId> = (0..3)
            .map(|_| register(&registry, ScriptedRecovery::with(vec![])).0)
            .collect();
        assert_eq!(host.wake_acquired.load(Ordering::SeqCst), 1);

        assert!(registry.unregister(ids[0]).await);
        assert!(registry.unregister(ids[1]).await);
        assert_eq!(host.wake_released.load(Ordering::SeqCst), 0);

        assert!(registry.unregister(ids[2]).await);
        assert_eq!(host.wake_released.load(Ordering::SeqCst), 1);
        assert!(!registry.unregister(ids[2]).await);

        register(&registry, ScriptedRecovery::with(vec![]));
        assert_eq!(host.wake_acquired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_background_execution_requested_once() {
        let host = Arc::new(RecordingHost::default());
        let registry = registry(&host);

        let (a, _rx_a) = register(&registry, ScriptedRecovery::with(vec![]));
        let (b, _rx_b) = register(&registry, ScriptedRecovery::with(vec![]));
        registry.notify(LifecycleEvent::Background).await;
        assert_eq!(host.background_begun.load(Ordering::SeqCst), 1);

        let (c, _rx_c) = register(&registry, ScriptedRecovery::with(vec![]));
        assert_eq!(host.background_begun.load(Ordering::SeqCst), 1);

        for id in [a, b, c] {
            registry.unregister(id).await;
        }
        assert_eq!(host.background_ended.load(Ordering::SeqCst), 1);
        assert!(!registry.summary().background_granted);
    }

    #[tokio::test]
    async fn test_register_while_backgrounded_requests_execution() {
        let host = Arc::new(RecordingHost::default());
        let registry = registry(&host);

        registry.notify(LifecycleEvent::Background).await;
        assert_eq!(host.background_begun.load(Ordering::SeqCst), 0);

        register(&registry, ScriptedRecovery::with(vec![]));
        assert_eq!(host.background_begun.load(Ordering::SeqCst), 1);
        assert!(registry.summary().background_granted);
    }

    #[tokio::test]
    async fn test_background_denied_suspends_until_foreground() {
        let host = Arc::new(RecordingHost::default());
        host.deny_background.store(true, Ordering::SeqCst);
        let registry = registry(&host);
        let recovery = ScriptedRecovery::with(vec![Ok(())]);
        let (id, mut rx) = register(&registry, recovery.clone());

        registry.notify(LifecycleEvent::Background).await;
        assert_eq!(rx.recv().await, Some(StreamNotice::Suspended));
        assert_eq!(registry.state(id), Some(StreamState::Suspended));

        registry.report_failure(id, transport_error());
        assert_eq!(recovery.calls(), 0);

        registry.notify(LifecycleEvent::Foreground).await;
        assert_eq!(rx.recv().await, Some(StreamNotice::Recovering { attempt: 1 }));
        assert_eq!(rx.recv().await, Some(StreamNotice::Recovered));
        assert_eq!(registry.state(id), Some(StreamState::Active));
        assert_eq!(recovery.calls(), 1);
        assert!(!registry.metadata(id).unwrap().suspended);
    }

    /// Reports a transport failure from inside its own recovery attempt
    #[derive(Default)]
    struct BreaksDuringAttempt {
        registry: std::sync::OnceLock<SessionRegistry>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl RecoveryCallback for BreaksDuringAttempt {
        async fn attempt_recovery(&self, context: RecoveryContext) -> Result<(), TetherError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                if let Some(registry) = self.registry.get() {
                    registry.report_failure(context.stream_id, transport_error());
                }
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_during_attempt_is_retried() {
        let host = Arc::new(RecordingHost::default());
        let registry = registry(&host);
        let recovery = Arc::new(BreaksDuringAttempt::default());
        let _ = recovery.registry.set(registry.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = registry.register(
            Box::new(NoSubscription),
            tx,
            recovery.clone(),
            StreamMetadata::new("conv".into(), "msg".into()),
        );

        registry.report_failure(id, transport_error());

        assert_eq!(rx.recv().await, Some(StreamNotice::Recovering { attempt: 1 }));
        assert_eq!(
            rx.recv().await,
            Some(StreamNotice::RetryScheduled {
                attempt: 1,
                delay: Duration::from_secs(2)
            })
        );
        assert_eq!(rx.recv().await, Some(StreamNotice::Recovering { attempt: 2 }));
        assert_eq!(rx.recv().await, Some(StreamNotice::Recovered));
        assert_eq!(registry.state(id), Some(StreamState::Active));
        assert_eq!(recovery.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_backoff_then_recovered() {
        let host = Arc::new(RecordingHost::default());
        let registry = registry(&host);
        let recovery = ScriptedRecovery::with(vec![Err(transport_error()), Ok(())]);
        let (id, mut rx) = register(&registry, recovery.clone());

        let started = tokio::time::Instant::now();
        registry.report_failure(id, transport_error());

        assert_eq!(rx.recv().await, Some(StreamNotice::Recovering { attempt: 1 }));
        assert_eq!(
            rx.recv().await,
            Some(StreamNotice::RetryScheduled {
                attempt: 1,
                delay: Duration::from_secs(2)
            })
        );
        assert_eq!(rx.recv().await, Some(StreamNotice::Recovering { attempt: 2 }));
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(rx.recv().await, Some(StreamNotice::Recovered));

        assert_eq!(registry.state(id), Some(StreamState::Active));
        assert_eq!(recovery.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_exactly_once() {
        let host = Arc::new(RecordingHost::default());
        let registry = registry(&host);
        let recovery = ScriptedRecovery::with((0..5).map(|_| Err(transport_error())).collect());
        let (id, mut rx) = register(&registry, recovery.clone());

        registry.report_failure(id, transport_error());

        let mut notices = Vec::new();
        while let Some(notice) = rx.recv().await {
            notices.push(notice);
        }

        assert_eq!(
            notices,
            vec![
                StreamNotice::Recovering { attempt: 1 },
                StreamNotice::RetryScheduled {
                    attempt: 1,
                    delay: Duration::from_secs(2)
                },
                StreamNotice::Recovering { attempt: 2 },
                StreamNotice::RetryScheduled {
                    attempt: 2,
                    delay: Duration::from_secs(4)
                },
                StreamNotice::Recovering { attempt: 3 },
                StreamNotice::Failed(TetherError::RetriesExhausted { attempts: 3 }),
            ]
        );
        assert_eq!(recovery.calls(), 3);
        assert!(!registry.is_active(id));
        assert_eq!(registry.summary().total_failed, 1);
        assert_eq!(host.wake_released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_report_fails_without_attempt() {
        let host = Arc::new(RecordingHost::default());
        let registry = registry(&host);
        let recovery = ScriptedRecovery::with(vec![]);
        let (id, mut rx) = register(&registry, recovery.clone());

        registry.report_failure(id, TetherError::Auth("token expired".into()));

        assert_eq!(
            rx.recv().await,
            Some(StreamNotice::Failed(TetherError::Auth("token expired".into())))
        );
        assert_eq!(rx.recv().await, None);
        assert_eq!(recovery.calls(), 0);
    }

    #[tokio::test]
    async fn test_auth_error_during_recovery_not_retried() {
        let host = Arc::new(RecordingHost::default());
        let registry = registry(&host);
        let recovery = ScriptedRecovery::with(vec![Err(TetherError::Auth("revoked".into()))]);
        let (id, mut rx) = register(&registry, recovery.clone());

        registry.report_failure(id, transport_error());

        assert_eq!(rx.recv().await, Some(StreamNotice::Recovering { attempt: 1 }));
        assert_eq!(
            rx.recv().await,
            Some(StreamNotice::Failed(TetherError::Auth("revoked".into())))
        );
        assert_eq!(rx.recv().await, None);
        assert_eq!(recovery.calls(), 1);
    }

    #[tokio::test]
    async fn test_connectivity_lost_then_restored() {
        let host = Arc::new(RecordingHost::default());
        let registry = registry(&host);
        let recovery = ScriptedRecovery::with(vec![Ok(())]);
        let (id, mut rx) = register(&registry, recovery.clone());

        registry.notify(LifecycleEvent::ConnectivityLost).await;
        assert_eq!(rx.recv().await, Some(StreamNotice::Suspended));

        registry.report_failure(id, transport_error());
        assert_eq!(registry.state(id), Some(StreamState::Suspended));
        assert_eq!(recovery.calls(), 0);

        registry.notify(LifecycleEvent::ConnectivityRestored).await;
        assert_eq!(rx.recv().await, Some(StreamNotice::Recovering { attempt: 1 }));
        assert_eq!(rx.recv().await, Some(StreamNotice::Recovered));
        assert_eq!(recovery.calls(), 1);
    }

    #[tokio::test]
    async fn test_about_to_suspend_persists_metadata() {
        let host = Arc::new(RecordingHost::default());
        let store = RecoveryStore::open(Arc::new(MemoryStorage::new()), Default::default())
            .await
            .unwrap();
        let registry = SessionRegistry::new(config(), host.clone(), Some(store.clone()));
        let (id, _rx) = register(&registry, ScriptedRecovery::with(vec![]));

        registry.update_progress(id, ProgressUpdate::appended("partial").with_sequence(3));
        registry.notify(LifecycleEvent::AboutToSuspend).await;

        let saved = store.load(id).unwrap();
        assert_eq!(saved.last_content, "partial");
        assert_eq!(saved.last_chunk_sequence, 3);
        assert!(saved.suspended);

        registry.unregister(id).await;
        assert!(store.load(id).is_none());
    }

    #[tokio::test]
    async fn test_update_progress_append_and_replace() {
        let host = Arc::new(RecordingHost::default());
        let registry = registry(&host);
        let (id, _rx) = register(&registry, ScriptedRecovery::with(vec![]));

        assert_eq!(
            registry.update_progress(id, ProgressUpdate::appended("Hello")),
            Some(ContentChange::Appended {
                delta: "Hello".into()
            })
        );
        assert_eq!(
            registry.update_progress(id, ProgressUpdate::snapshot("Help")),
            Some(ContentChange::Replaced { previous_len: 5 })
        );

        let metadata = registry.metadata(id).unwrap();
        assert_eq!(metadata.last_content, "Help");
        assert_eq!(metadata.content_revision, 1);
        assert_eq!(
            registry.update_progress(StreamId::new(), ProgressUpdate::appended("x")),
            None
        );
    }

    #[tokio::test]
    async fn test_recover_stalled_streams() {
        let host = Arc::new(RecordingHost::default());
        let registry = registry(&host);
        let recovery = ScriptedRecovery::with(vec![Ok(())]);
        let (_id, mut rx) = register(&registry, recovery.clone());

        assert_eq!(registry.recover_stalled_at(Utc::now()), 0);

        let later = Utc::now() + chrono::Duration::minutes(3);
        assert_eq!(registry.recover_stalled_at(later), 1);
        assert_eq!(rx.recv().await, Some(StreamNotice::Recovering { attempt: 1 }));
        assert_eq!(rx.recv().await, Some(StreamNotice::Recovered));
        assert_eq!(recovery.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_cancels_subscription_and_pending_retry() {
        let host = Arc::new(RecordingHost::default());
        let registry = registry(&host);
        let recovery = ScriptedRecovery::with(vec![Err(transport_error())]);
        let cancelled = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = registry.register(
            Box::new(FlagSubscription(cancelled.clone())),
            tx,
            recovery.clone(),
            StreamMetadata::new("conv".into(), "msg".into()),
        );

        registry.report_failure(id, transport_error());
        assert_eq!(rx.recv().await, Some(StreamNotice::Recovering { attempt: 1 }));
        assert!(matches!(
            rx.recv().await,
            Some(StreamNotice::RetryScheduled { attempt: 1, .. })
        ));

        cancelled.store(false, Ordering::SeqCst);
        assert!(registry.unregister(id).await);
        assert!(cancelled.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(recovery.calls(), 1);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_force_recover() {
        let host = Arc::new(RecordingHost::default());
        let registry = registry(&host);
        let recovery = ScriptedRecovery::with(vec![Ok(())]);
        let (id, mut rx) = register(&registry, recovery.clone());

        assert!(registry.force_recover(id));
        assert_eq!(rx.recv().await, Some(StreamNotice::Recovering { attempt: 1 }));
        assert_eq!(rx.recv().await, Some(StreamNotice::Recovered));
        assert!(!registry.force_recover(StreamId::new()));
    }
}
