//! Stream lifecycle coordination
//!
//! [`SessionRegistry`] is the single owner of every live stream's lifecycle:
//! it holds the host resources while streams exist, suspends streams when
//! the app or network goes away and recovers them with backoff afterwards.

mod host;
mod lifecycle;
mod session;

pub use host::{HostCapabilities, NoSubscription, NoopHost, Subscription, SubscriptionSlot};
pub use lifecycle::{
    AppState, LifecycleEvent, ProgressUpdate, RecoveryCallback, RecoveryContext, StreamNotice,
    StreamState,
};
pub use session::{RegistryConfig, RegistrySummary, SessionRegistry};
