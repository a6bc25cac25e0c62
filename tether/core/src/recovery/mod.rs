//! Stream metadata and the persisted recovery mirror

mod metadata;
mod store;

pub use metadata::{ContentChange, ContentUpdate, RecoveryRecord, StreamMetadata};
pub use store::{RecoveryConfig, RecoveryStore, RECOVERY_KEY};
