//! garm-daemon entry point.
//!
//! This file is intentionally thin: it loads configuration, builds the
//! controller, wires middleware, and starts the HTTP intake. Route handlers
//! live in `routes.rs`; controller assembly lives in `boot.rs`.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use garm_daemon::{boot, routes};
use garm_store::MemoryStore;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

#[derive(Debug, Parser)]
#[command(name = "garm-daemon", about = "GitHub Actions Runner Manager")]
struct Args {
    /// Configuration files, merged in order (later files override).
    #[arg(short, long, default_value = "/etc/garm/config.yaml")]
    config: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist — production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();
    let args = Args::parse();

    let loaded = garm_config::load_layered_yaml(&args.config)?;
    info!(config_hash = %loaded.config_hash, "configuration loaded");
    let config = loaded.into_garm_config()?;

    let store = Arc::new(MemoryStore::new());
    let controller = boot::boot(&config, store).await?;

    let app = routes::build_router(Arc::clone(&controller.state)).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    let addr = bind_addr(&config)?;
    info!("garm-daemon listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    controller.shutdown().await;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn bind_addr(config: &garm_config::GarmConfig) -> anyhow::Result<SocketAddr> {
    let raw = std::env::var("GARM_DAEMON_ADDR").unwrap_or_else(|_| config.daemon.bind.clone());
    raw.parse()
        .with_context(|| format!("invalid bind address {raw}"))
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // If the signal handler cannot be installed, run until killed.
        std::future::pending::<()>().await;
    }
}
