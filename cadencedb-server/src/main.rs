//! CadenceDB Server - HTTP API for the time-series storage engine

mod api;

use anyhow::Context;
use cadencedb_core::storage::{StorageConfig, StorageEngine};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Server configuration
#[derive(Debug, Clone, Parser)]
#[command(name = "cadencedb", version, about = "CadenceDB time-series storage server")]
pub struct ServerConfig {
    /// HTTP listen address
    #[arg(long, env = "CADENCEDB_HTTP_ADDR", default_value = "0.0.0.0:8086")]
    pub http_addr: SocketAddr,

    /// Data directory
    #[arg(long, env = "CADENCEDB_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Worker threads; every series is pinned to one
    #[arg(long, env = "CADENCEDB_WORKER_THREADS", default_value_t = cadencedb_core::config::WORKER_THREADS)]
    pub worker_threads: usize,

    /// Pending tasks per worker before requests are refused
    #[arg(long, env = "CADENCEDB_WORKER_QUEUE_LIMIT", default_value_t = cadencedb_core::config::WORKER_QUEUE_LIMIT)]
    pub worker_queue_limit: usize,

    /// Sparse file size in bytes that triggers optimization
    #[arg(long, env = "CADENCEDB_SPARSE_OPTIMIZE_SIZE", default_value_t = cadencedb_core::config::SPARSE_FILE_OPTIMIZE_SIZE)]
    pub sparse_file_optimize_size: u64,

    /// Hard cap on a sparse file's size in bytes
    #[arg(long, env = "CADENCEDB_SPARSE_MAX_SIZE", default_value_t = cadencedb_core::config::SPARSE_FILE_MAX_SIZE)]
    pub sparse_file_max_size: u64,

    /// Most datapoints one read response carries; larger ranges are truncated
    #[arg(
        long,
        env = "CADENCEDB_MAX_READ_DATAPOINTS",
        default_value_t = 1_000_000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub max_read_datapoints: u64,

    /// Seconds the flusher sleeps when there is nothing to flush
    #[arg(long, env = "CADENCEDB_FLUSH_IDLE_SECS", default_value_t = 5)]
    pub flush_idle_secs: u64,
}

impl ServerConfig {
    fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            data_dir: self.data_dir.clone(),
            worker_threads: self.worker_threads,
            worker_queue_limit: self.worker_queue_limit,
            sparse_file_optimize_size: self.sparse_file_optimize_size,
            sparse_file_max_size: self.sparse_file_max_size,
            flusher_idle_sleep: std::time::Duration::from_secs(self.flush_idle_secs),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ServerConfig::parse();

    info!("Starting CadenceDB server...");
    info!("Data directory: {:?}", config.data_dir);
    info!("HTTP server: http://{}", config.http_addr);

    let engine = StorageEngine::open(config.storage_config())
        .with_context(|| format!("failed to open storage at {}", config.data_dir.display()))?;
    let engine = Arc::new(engine);

    let app = api::create_router(engine.clone(), config.max_read_datapoints);

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;
    info!("CadenceDB server listening on {}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Flushing buffered datapoints before exit");
    let flushed = tokio::task::spawn_blocking(move || {
        let flushed = engine.flush_all();
        engine.shutdown();
        flushed
    })
    .await??;
    info!("Flushed {} series, goodbye", flushed);

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
