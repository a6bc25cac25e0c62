//! Tether CLI - Resilient Stream and Upload Driver
//!
//! Thin command-line front end over `tether-core`: opens a push stream and
//! prints the reply as it arrives, reconstructs background-job replies by
//! polling, and drives the durable upload queue.
//!
//! # Usage
//!
//! ```bash
//! # Stream a reply (resumes with Last-Event-ID if the connection drops)
//! tether stream --url https://api.example.com/v1/chat --body '{"prompt":"hi"}'
//!
//! # Follow a background job by polling
//! tether poll --base-url https://api.example.com/v1/jobs --resource job-1 --message msg-1
//!
//! # Queue files for upload; unfinished items survive restarts
//! tether upload --endpoint https://api.example.com/v1/files a.png b.pdf
//!
//! # Verbose logging
//! RUST_LOG=debug tether stream --url ...
//! ```
//!
//! # Signals
//!
//! - `SIGINT`: stop the current command; queued uploads stay persisted

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use tether_core::config::{load_config_from_path, ConfigOverrides, TetherConfig};
use tether_core::transport::build_client;
use tether_core::{
    CredentialProvider, FileStorage, HttpPollingEndpoint, HttpTransport, HttpUploader, MessageId,
    NewUpload, NoopHost, PushRequest, QueueChange, RecoveryStore, SessionRegistry, StaticToken,
    StreamClient, StreamMetadata, TextChunk, UploadQueue, UploadStatus,
};

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "TETHER_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory for recovery snapshots and the upload queue
    #[arg(long, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// Bearer token sent with every request
    #[arg(long, env = "TETHER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Recovery attempts before a stream is given up
    #[arg(long)]
    max_recovery_attempts: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "TETHER_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open a push stream and print the reply
    Stream {
        /// Streaming endpoint
        #[arg(long)]
        url: String,

        /// JSON request body
        #[arg(long, default_value = "{}")]
        body: String,

        /// Conversation the reply belongs to
        #[arg(long, default_value = "cli")]
        conversation: String,

        /// Message id of the reply
        #[arg(long, default_value = "cli-reply")]
        message: String,
    },

    /// Reconstruct a background job's reply by polling
    Poll {
        /// Base URL; snapshots are fetched from `{base_url}/{resource}`
        #[arg(long)]
        base_url: String,

        /// Job or conversation id to poll
        #[arg(long)]
        resource: String,

        /// Message id of the reply
        #[arg(long)]
        message: String,

        /// Poll interval in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Overall deadline in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Queue files for upload and drain the queue
    Upload {
        /// Upload endpoint (files are sent with PUT)
        #[arg(long)]
        endpoint: String,

        /// Files to add before draining
        files: Vec<PathBuf>,
    },

    /// Show the persisted upload queue
    Uploads {
        /// Drop failed and cancelled items
        #[arg(long)]
        clear_failed: bool,
    },

    /// List persisted streams that can still be resumed
    Recoverable,

    /// Print the effective configuration
    Config,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("tether={level},tether_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn load_settings(args: &Args) -> Result<TetherConfig> {
    let path = args
        .config
        .clone()
        .or_else(tether_core::config::default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(dir) = &args.state_dir {
        overrides = overrides.with_state_dir(dir.clone());
    }
    if let Some(attempts) = args.max_recovery_attempts {
        overrides = overrides.with_max_recovery_attempts(attempts);
    }
    if let Command::Poll {
        interval_ms,
        timeout_secs,
        ..
    } = &args.command
    {
        if let Some(ms) = interval_ms {
            overrides = overrides.with_poll_interval_ms(*ms);
        }
        if let Some(secs) = timeout_secs {
            overrides = overrides.with_poll_timeout_secs(*secs);
        }
    }
    overrides
        .apply(&mut config)
        .context("Invalid command-line override")?;
    Ok(config)
}

fn storage_for(config: &TetherConfig) -> Result<Arc<FileStorage>> {
    let dir = config
        .state_dir
        .clone()
        .context("No state directory known; pass --state-dir or set TETHER_STATE_DIR")?;
    Ok(Arc::new(FileStorage::new(dir)))
}

fn credentials(args: &Args) -> Option<Arc<dyn CredentialProvider>> {
    args.token
        .clone()
        .map(|token| Arc::new(StaticToken::new(token)) as Arc<dyn CredentialProvider>)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = load_settings(&args)?;
    info!(source = %config.source(), "Configuration loaded");

    match &args.command {
        Command::Stream {
            url,
            body,
            conversation,
            message,
        } => {
            let body = serde_json::from_str(body).context("--body is not valid JSON")?;
            let metadata = StreamMetadata::new(conversation.as_str().into(), message.as_str().into());
            run_stream(&args, &config, PushRequest::new(url.clone(), body), metadata).await
        }
        Command::Poll {
            base_url,
            resource,
            message,
            ..
        } => run_poll(&args, &config, base_url, resource, message).await,
        Command::Upload { endpoint, files } => run_upload(&args, &config, endpoint, files).await,
        Command::Uploads { clear_failed } => show_uploads(&config, *clear_failed).await,
        Command::Recoverable => show_recoverable(&config).await,
        Command::Config => {
            println!("# source: {}", config.source());
            if let Some(path) = &config.config_file_path {
                println!("# file: {}", path.display());
            }
            println!("{config:#?}");
            Ok(())
        }
    }
}

fn stream_client(
    args: &Args,
    config: &TetherConfig,
    registry: SessionRegistry,
    base_url: &str,
) -> Result<StreamClient> {
    let http = build_client(config.connect_timeout)?;
    let mut transport = HttpTransport::new(http.clone());
    let mut endpoint = HttpPollingEndpoint::new(http, base_url);
    if let Some(provider) = credentials(args) {
        transport = transport.with_credentials(Arc::clone(&provider));
        endpoint = endpoint.with_credentials(provider);
    }
    Ok(StreamClient::new(
        Arc::new(transport),
        Arc::new(endpoint),
        registry,
        config.client_config(),
    ))
}

async fn run_stream(
    args: &Args,
    config: &TetherConfig,
    request: PushRequest,
    metadata: StreamMetadata,
) -> Result<()> {
    let store = match storage_for(config) {
        Ok(storage) => Some(
            RecoveryStore::open(storage, config.recovery.clone())
                .await
                .context("Failed to open recovery store")?,
        ),
        Err(e) => {
            warn!(error = %e, "Running without persisted recovery");
            None
        }
    };
    let registry = SessionRegistry::new(config.registry.clone(), Arc::new(NoopHost), store);
    let monitor = registry.spawn_inactivity_monitor();
    let client = stream_client(args, config, registry, &request.url)?;

    let (mut chunks, stream_id) = client
        .open_push_stream(request, metadata)
        .await
        .context("Failed to open push stream")?;
    info!(stream_id = %stream_id, "Streaming");

    let result = loop {
        tokio::select! {
            chunk = chunks.recv() => match chunk {
                Some(TextChunk::Delta(text)) => print!("{text}"),
                Some(TextChunk::Replace) => println!(),
                Some(TextChunk::Finished { reason }) => {
                    println!();
                    info!(reason = reason.as_deref().unwrap_or("done"), "Reply complete");
                    break Ok(());
                }
                Some(TextChunk::Failed(e)) => {
                    println!();
                    break Err(anyhow::Error::new(e).context("Stream failed"));
                }
                None => break Ok(()),
            },
            _ = signal::ctrl_c() => {
                info!("Interrupted, cancelling stream");
                client.cancel(stream_id).await;
                break Ok(());
            }
        }
    };

    monitor.abort();
    result
}

async fn run_poll(
    args: &Args,
    config: &TetherConfig,
    base_url: &str,
    resource: &str,
    message: &str,
) -> Result<()> {
    let registry = SessionRegistry::new(config.registry.clone(), Arc::new(NoopHost), None);
    let client = stream_client(args, config, registry, base_url)?;
    let mut chunks = client.open_polling_fallback(resource, MessageId::new(message));

    loop {
        tokio::select! {
            chunk = chunks.recv() => match chunk {
                Some(TextChunk::Delta(text)) => print!("{text}"),
                Some(TextChunk::Replace) => println!("\n--- reply rewritten ---"),
                Some(TextChunk::Finished { reason }) => {
                    println!();
                    info!(reason = reason.as_deref().unwrap_or("done"), "Polling finished");
                    return Ok(());
                }
                Some(TextChunk::Failed(e)) => {
                    println!();
                    return Err(anyhow::Error::new(e).context("Polling failed"));
                }
                None => return Ok(()),
            },
            _ = signal::ctrl_c() => {
                info!("Interrupted");
                return Ok(());
            }
        }
    }
}

async fn open_queue(config: &TetherConfig, uploader: HttpUploader) -> Result<UploadQueue> {
    UploadQueue::open(storage_for(config)?, Arc::new(uploader), config.upload.clone())
        .await
        .context("Failed to open upload queue")
}

async fn run_upload(
    args: &Args,
    config: &TetherConfig,
    endpoint: &str,
    files: &[PathBuf],
) -> Result<()> {
    let mut uploader = HttpUploader::new(build_client(config.connect_timeout)?, endpoint);
    if let Some(provider) = credentials(args) {
        uploader = uploader.with_credentials(provider);
    }
    let queue = open_queue(config, uploader).await?;
    let mut changes = queue.changes();

    for path in files {
        let upload = NewUpload::from_path(path)
            .await
            .with_context(|| format!("Cannot queue {}", path.display()))?;
        queue.enqueue(upload).await?;
    }

    let scheduler = queue.spawn_scheduler();
    let unfinished = |queue: &UploadQueue| {
        queue
            .items()
            .iter()
            .filter(|i| !i.status.is_terminal())
            .count()
    };

    while unfinished(&queue) > 0 {
        tokio::select! {
            change = changes.next() => match change {
                Some(Ok(QueueChange::Completed { id, remote_id })) => println!("{id} uploaded as {remote_id}"),
                Some(Ok(QueueChange::Failed { id, error })) => println!("{id} failed: {error}"),
                Some(Ok(QueueChange::RetryScheduled { id, attempt, next_retry_at })) => {
                    println!("{id} attempt {attempt} failed, retrying at {next_retry_at}");
                }
                Some(Ok(other)) => tracing::debug!(change = ?other, "Queue change"),
                Some(Err(e)) => warn!(error = %e, "Missed queue changes"),
                None => break,
            },
            _ = signal::ctrl_c() => {
                info!(pending = unfinished(&queue), "Interrupted; pending uploads stay queued");
                break;
            }
        }
    }

    scheduler.abort();
    Ok(())
}

async fn show_uploads(config: &TetherConfig, clear_failed: bool) -> Result<()> {
    // Listing never uploads, so the endpoint is irrelevant.
    let queue = open_queue(config, HttpUploader::new(build_client(config.connect_timeout)?, "")).await?;
    if clear_failed {
        let removed = queue.clear_failed().await?;
        info!(removed, "Cleared failed uploads");
    }

    for item in queue.items() {
        let detail = match item.status {
            UploadStatus::Completed => item.remote_id.clone().unwrap_or_default(),
            UploadStatus::Failed | UploadStatus::Pending => item.last_error.clone().unwrap_or_default(),
            UploadStatus::Uploading | UploadStatus::Cancelled => String::new(),
        };
        println!(
            "{}\t{}\t{}\t{} bytes\t{}",
            item.id, item.status, item.file_name, item.size, detail
        );
    }
    Ok(())
}

async fn show_recoverable(config: &TetherConfig) -> Result<()> {
    let store = RecoveryStore::open(storage_for(config)?, config.recovery.clone())
        .await
        .context("Failed to open recovery store")?;

    for record in store.recover_all() {
        let metadata = &record.metadata;
        println!(
            "{}\t{}\t{}\tlast_event_id={}\t{} chars",
            record.stream_id,
            metadata.conversation_id,
            metadata.message_id,
            metadata.last_event_id.as_deref().unwrap_or("-"),
            metadata.last_content.chars().count()
        );
    }
    Ok(())
}
