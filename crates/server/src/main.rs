// crates/server/src/main.rs
//! Angel server binary.
//!
//! Opens the catalog, starts the session watcher (with its startup scan),
//! spawns the housekeeping loops, and serves the API until SIGINT.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use angel_core::Config;
use angel_db::Store;
use angel_server::{create_app, AppState};

/// How often idle attachments and stale temporary sessions are swept.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "angel", about = "Session server for the Angel agent platform")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 8085, env = "ANGEL_PORT")]
    port: u16,

    /// Data directory (catalog, session DBs, sandboxes). Overrides
    /// ANGEL_DATA_DIR.
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(data_dir) = args.data_dir {
        config = Config::with_data_dir(data_dir);
    }
    let temp_session_ttl = config.temp_session_ttl;
    let attach_idle_ttl = config.attach_idle_ttl;

    let store = Store::open(config).await.context("opening catalog")?;
    store
        .start_watcher()
        .await
        .context("starting session watcher")?;

    let state = AppState::new(store);

    // Housekeeping: detach idle attachments and sweep stale temp sessions.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HOUSEKEEPING_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let detached = state.store.pool().housekeep(attach_idle_ttl);
                if detached > 0 {
                    tracing::debug!(detached, "housekeeping pass");
                }
                if let Err(err) = state
                    .store
                    .cleanup_old_temporary_sessions(temp_session_ttl)
                    .await
                {
                    tracing::warn!(error = %err, "temp session cleanup failed");
                }
            }
        });
    }

    let app = create_app(state.clone());
    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "angel server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("shutting down");
    state.streams.shutdown();
    state.store.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install ctrl-c handler");
    }
}
