//! Host environment capabilities
//!
//! The registry needs two process-wide resources from whatever is hosting it:
//! a "keep the device awake" lock and permission to keep running while the app
//! is in the background. Both are reference-counted by the registry (acquired
//! on the first stream, released after the last), so implementations only see
//! balanced acquire/release calls.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::AbortHandle;

/// Process-level capabilities supplied by the host
pub trait HostCapabilities: Send + Sync {
    /// Keep the device from idling while streams are active
    fn acquire_wake_lock(&self);

    /// Let the device idle again
    fn release_wake_lock(&self);

    /// Ask to keep executing while backgrounded
    ///
    /// Returns `false` if the host cannot grant it; streams are then
    /// suspended until the app returns to the foreground.
    fn begin_background_execution(&self) -> bool;

    /// Give up the background execution grant
    fn end_background_execution(&self);
}

/// Host that is never suspended (servers, CLIs)
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHost;

impl HostCapabilities for NoopHost {
    fn acquire_wake_lock(&self) {}

    fn release_wake_lock(&self) {}

    fn begin_background_execution(&self) -> bool {
        true
    }

    fn end_background_execution(&self) {}
}

/// Handle to the transport work feeding one stream
pub trait Subscription: Send + Sync {
    /// Stop delivering data; an in-flight read may still complete
    fn cancel(&self);
}

impl Subscription for AbortHandle {
    fn cancel(&self) {
        self.abort();
    }
}

/// Subscription with nothing to cancel
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSubscription;

impl Subscription for NoSubscription {
    fn cancel(&self) {}
}

/// Subscription whose underlying task is swapped on every reconnect
#[derive(Clone, Default)]
pub struct SubscriptionSlot {
    current: Arc<Mutex<Option<AbortHandle>>>,
}

impl SubscriptionSlot {
    /// Create an empty slot
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the task for the current connection, aborting any previous one
    pub fn replace(&self, handle: AbortHandle) {
        if let Some(previous) = self.current.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Whether a task is installed
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.current.lock().is_some()
    }
}

impl Subscription for SubscriptionSlot {
    fn cancel(&self) {
        if let Some(handle) = self.current.lock().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for SubscriptionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionSlot")
            .field("set", &self.is_set())
            .finish()
    }
}
