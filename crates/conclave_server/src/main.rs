//! CONCLAVE Server
//!
//! Runs the registry behind its HTTP API until interrupted.

#![warn(missing_docs)]
#![warn(clippy::all)]

use anyhow::{Context, Result};
use clap::Parser;
use conclave_registry::{RegistryService, TcpPushTransport};
use conclave_server::{router, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conclave-server")]
#[command(about = "CONCLAVE membership registry", long_about = None)]
struct Args {
    /// Bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Periodically log a table of pool statistics
    #[arg(long)]
    print_stats: bool,

    /// Log every membership change at info level
    #[arg(long)]
    print_events: bool,

    /// Reaper wake interval in milliseconds
    #[arg(long)]
    reaper_interval_ms: Option<u64>,

    /// How long to wait for pools to end on shutdown, in milliseconds
    #[arg(long)]
    shutdown_timeout_ms: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(ms) = self.shutdown_timeout_ms {
            config.shutdown_timeout_ms = ms;
        }
        if let Some(ms) = self.reaper_interval_ms {
            config.registry.reaper_interval_ms = ms;
        }
        config.registry.print_stats |= self.print_stats;
        config.registry.print_events |= self.print_events;
        Ok(config)
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("conclave=info,tower_http=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json);
    let config = args.into_config()?;

    let transport = Arc::new(TcpPushTransport::new(config.registry.connect_timeout()));
    let registry = RegistryService::start(config.registry.clone(), transport);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("cannot bind {}", config.bind))?;
    info!(bind = %config.bind, "conclave server listening");

    axum::serve(listener, router(registry.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;

    if !registry.end(config.shutdown_timeout()).await {
        warn!("some pools were still active at shutdown");
    }
    Ok(())
}
