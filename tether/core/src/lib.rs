//! Tether Core - Transport Resilience for Streamed Chat Replies
//!
//! This crate keeps a chat client's reply streams alive across flaky networks
//! and app suspension. It is independent of any UI framework: a host app
//! reports lifecycle changes and consumes [`TextChunk`]s, everything else
//! lives here.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     Host app / orchestration                     │
//! │   LifecycleEvent (up)                        TextChunk (down)    │
//! └─────────┬──────────────────────────────────────────▲─────────────┘
//!           │                                          │
//! ┌─────────┼──────────────────────────────────────────┼─────────────┐
//! │         ▼                 TETHER CORE              │             │
//! │  ┌─────────────────┐   ┌──────────────┐   ┌────────┴────────┐    │
//! │  │ SessionRegistry │◄──│ StreamClient │──►│   EventParser   │    │
//! │  │ (suspend/retry) │   │   (facade)   │   │  (SSE framing)  │    │
//! │  └───────┬─────────┘   └──────┬───────┘   └─────────────────┘    │
//! │          │                    │                                  │
//! │  ┌───────▼─────────┐   ┌──────▼───────┐   ┌─────────────────┐    │
//! │  │  RecoveryStore  │   │ DeltaPoller  │   │   UploadQueue   │    │
//! │  │ (crash mirror)  │   │  (fallback)  │   │ (durable files) │    │
//! │  └───────┬─────────┘   └──────────────┘   └────────┬────────┘    │
//! │          └──────────────► Storage ◄────────────────┘             │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`StreamClient`]: Opens push streams and polling fallbacks
//! - [`SessionRegistry`]: Owns stream lifecycle, host resources and recovery
//! - [`EventParser`]: Incremental Server-Sent Events parser with heartbeat
//! - [`RecoveryStore`]: Persisted stream metadata that survives restarts
//! - [`DeltaPoller`]: Turns repeated JSON snapshots into text deltas
//! - [`UploadQueue`]: Durable attachment uploads with per-item backoff
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tether_core::{
//!     config::load_config, FileStorage, HttpPollingEndpoint, HttpTransport, NoopHost,
//!     PushRequest, RecoveryStore, SessionRegistry, StreamClient, StreamMetadata, TextChunk,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config()?;
//!     let storage = Arc::new(FileStorage::new(config.state_dir.clone().unwrap()));
//!     let store = RecoveryStore::open(storage, config.recovery.clone()).await?;
//!     let registry =
//!         SessionRegistry::new(config.registry.clone(), Arc::new(NoopHost), Some(store));
//!
//!     let http = tether_core::transport::build_client(config.connect_timeout)?;
//!     let client = StreamClient::new(
//!         Arc::new(HttpTransport::new(http.clone())),
//!         Arc::new(HttpPollingEndpoint::new(http, "https://api.example.com/jobs")),
//!         registry,
//!         config.client_config(),
//!     );
//!
//!     let request = PushRequest::new("https://api.example.com/chat", serde_json::json!({}));
//!     let (mut chunks, _id) = client.open_push_stream(request, StreamMetadata::new("conv-1".into(), "msg-1".into())).await?;
//!     while let Some(chunk) = chunks.recv().await {
//!         if let TextChunk::Delta(text) = chunk {
//!             print!("{text}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`sse`]: Byte-level SSE parsing and payload decoding
//! - [`recovery`]: Stream metadata and its persisted mirror
//! - [`registry`]: Lifecycle coordination, suspension and recovery backoff
//! - [`poller`]: Snapshot polling for background jobs
//! - [`upload`]: Durable upload queue and its HTTP uploader
//! - [`transport`]: Network seams and their `reqwest` implementations
//! - [`client`]: Facade tying the above together
//! - [`config`]: TOML, environment and CLI configuration
//! - [`storage`]: Key/value persistence used by the store and the queue

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod chunk;
pub mod client;
pub mod config;
pub mod error;
pub mod ids;
pub mod poller;
pub mod recovery;
pub mod registry;
pub mod retry;
pub mod sse;
pub mod storage;
pub mod transport;
pub mod upload;

// Re-exports for convenience
pub use chunk::TextChunk;
pub use client::{ClientConfig, StreamClient};
pub use config::{ConfigError, ConfigOverrides, ConfigSource, TetherConfig};
pub use error::{Result, TetherError};
pub use ids::{ConversationId, MessageId, SessionId, StreamId, UploadId};
pub use poller::{DeltaPoller, PollOutcome, PollerConfig, PollingEndpoint};
pub use recovery::{ContentChange, RecoveryConfig, RecoveryRecord, RecoveryStore, StreamMetadata};
pub use registry::{
    AppState, HostCapabilities, LifecycleEvent, NoopHost, ProgressUpdate, RecoveryCallback,
    RecoveryContext, RegistryConfig, RegistrySummary, SessionRegistry, StreamNotice, StreamState,
    Subscription,
};
pub use retry::{RetryDecision, RetryPolicy, RetryState};
pub use sse::{decode_payload, EventParser, ParserConfig, Payload, StreamEvent};
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError};
pub use transport::{
    CredentialProvider, HttpPollingEndpoint, HttpTransport, PushRequest, StaticToken,
    StreamTransport,
};
pub use upload::{
    HttpUploader, NewUpload, QueueChange, QueuedUploadItem, UploadConfig, UploadQueue,
    UploadStatus, Uploader,
};
