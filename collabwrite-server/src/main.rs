//! CollabWrite sync server.
//!
//! Serves the WebSocket protocol from `collabwrite-sync`, storing documents
//! in RocksDB when `--storage` is given and in memory otherwise. Logging is
//! controlled with `RUST_LOG`.

use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use collabwrite_sync::{CoordinatorConfig, ServerConfig, SyncServer};
use log::{info, warn};
use tokio::net::TcpListener;

/// Real-time collaborative editing server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, env = "COLLABWRITE_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory; documents are kept in memory when omitted
    #[arg(short, long, env = "COLLABWRITE_STORAGE")]
    storage: Option<PathBuf>,

    /// Maximum editors per document
    #[arg(long, env = "COLLABWRITE_MAX_PARTICIPANTS", default_value_t = 100)]
    max_participants: usize,

    /// Seconds between heartbeats to idle connections
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,

    /// Milliseconds between checkpoints of an edited document
    #[arg(long, env = "COLLABWRITE_CHECKPOINT_MS", default_value_t = 2_000)]
    checkpoint_ms: u64,

    /// Seconds between recorded versions
    #[arg(long, default_value_t = 60)]
    version_secs: u64,

    /// Versions kept per document
    #[arg(long, default_value_t = 10)]
    max_versions: usize,

    /// Committed operations kept in memory per document
    #[arg(long, default_value_t = 1_000)]
    history_limit: usize,

    /// Seconds an unobserved document stays loaded
    #[arg(long, default_value_t = 30)]
    idle_secs: u64,
}

impl Cli {
    fn server_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind,
            max_participants_per_document: self.max_participants,
            heartbeat_interval_secs: self.heartbeat_secs,
            storage_path: self.storage,
            coordinator: CoordinatorConfig {
                checkpoint_interval: Duration::from_millis(self.checkpoint_ms),
                version_interval: Duration::from_secs(self.version_secs),
                max_versions: self.max_versions,
                history_limit: self.history_limit,
                idle_timeout: Duration::from_secs(self.idle_secs),
                ..CoordinatorConfig::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Cli::parse().server_config();
    match &config.storage_path {
        Some(path) => info!("Storing documents in {}", path.display()),
        None => warn!("No storage path given; documents are lost on exit"),
    }

    let listener = TcpListener::bind(&config.bind_addr).await?;
    let server = SyncServer::new(config)?;
    server
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Could not listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("Server stopped");
    Ok(())
}
