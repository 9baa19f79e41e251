//! Blue Carbon sync agent
//!
//! Runs the sync layer headless against a backend:
//! 1. Keeps the configured topics live (socket, stream or polling)
//! 2. Persists outbound writes in a local SQLite queue
//! 3. Serves a small status API for operators
//!
//! Usage:
//!   bluecarbon-agent --api-url https://mrv.example.org --http-port 4002

use std::{path::PathBuf, sync::Arc};
use anyhow::{Context, Result};
use bluecarbon_agent::{build_router, AgentConfig, AGENT_VERSION};
use bluecarbon_api::Connectivity;
use bluecarbon_storage::SqliteStore;
use bluecarbon_sync::SyncClient;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "bluecarbon-agent")]
#[command(about = "Headless Blue Carbon sync agent")]
struct Args {
    /// JSON config file; flags below override it
    #[arg(short, long, env = "BLUECARBON_CONFIG")]
    config: Option<PathBuf>,

    /// Backend base URL
    #[arg(long, env = "BLUECARBON_API_URL")]
    api_url: Option<String>,

    /// Bearer token for the backend
    #[arg(long, env = "BLUECARBON_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Socket push endpoint
    #[arg(long, env = "BLUECARBON_SOCKET_URL")]
    socket_url: Option<String>,

    /// Server-push stream endpoint
    #[arg(long, env = "BLUECARBON_STREAM_URL")]
    stream_url: Option<String>,

    /// Topics to subscribe to (comma separated)
    #[arg(short, long, env = "BLUECARBON_TOPICS", value_delimiter = ',')]
    topics: Vec<String>,

    /// SQLite file holding the outbound queue
    #[arg(long, env = "BLUECARBON_QUEUE_DB", default_value = "bluecarbon-queue.db")]
    queue_db: PathBuf,

    /// HTTP status API port
    #[arg(long, default_value = "4002")]
    http_port: u16,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> Result<(AgentConfig, PathBuf, u16)> {
        let mut config = match &self.config {
            Some(path) => AgentConfig::load(path)?,
            None => AgentConfig::default(),
        };
        if let Some(url) = self.api_url {
            config.sync.api.base_url = url.trim_end_matches('/').to_string();
        }
        if self.token.is_some() {
            config.sync.api.bearer_token = self.token;
        }
        if let Some(url) = self.socket_url {
            config.sync.endpoints.socket_url = url;
        }
        if let Some(url) = self.stream_url {
            config.sync.endpoints.stream_url = url;
        }
        if !self.topics.is_empty() {
            config.topics = self.topics;
        }
        Ok((config, self.queue_db, self.http_port))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("{} starting...", AGENT_VERSION);
    let (config, queue_db, http_port) = args.into_config()?;

    let store = SqliteStore::open(&queue_db)
        .with_context(|| format!("Failed to open queue database {}", queue_db.display()))?;
    let client = SyncClient::start(config.sync.clone(), Arc::new(store), Connectivity::online())
        .context("Failed to start sync client")?;
    let client = Arc::new(client);

    let mut handles = Vec::with_capacity(config.topics.len());
    for topic in &config.topics {
        match client.subscribe(topic) {
            Ok(handle) => handles.push(handle),
            Err(e) => warn!("Skipping topic {:?}: {}", topic, e),
        }
    }
    client.connect();

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", http_port))
        .await
        .with_context(|| format!("Failed to bind HTTP port {}", http_port))?;
    let app = build_router(Arc::clone(&client));
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    println!("\n========================================");
    println!("  Blue Carbon Sync Agent Running");
    println!("========================================");
    println!("  Backend:   {}", config.sync.api.base_url);
    println!("  Topics:    {}", config.topics.join(", "));
    println!("  Queue DB:  {}", queue_db.display());
    println!("  HTTP Port: {}", http_port);
    println!("========================================\n");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Shutdown requested");
        }
        result = server => {
            match result {
                Ok(Ok(())) => warn!("HTTP server exited"),
                Ok(Err(e)) => warn!("HTTP server failed: {}", e),
                Err(e) => warn!("HTTP server task failed: {}", e),
            }
        }
    }

    for handle in &handles {
        client.unsubscribe(handle);
    }
    client.shutdown().await;
    info!("{} pending write(s) kept for next start", client.queue().pending_count());
    Ok(())
}
