mod api;
mod cli;
mod config;
mod events;
mod history;
mod jobs;
mod logging;
mod pipe;
mod state;
mod tasks;
mod terminal;
#[cfg(test)]
mod test_utils;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use crate::cli::Args;
use crate::config::load_config;
use crate::logging::init_tracing;
use crate::state::build_context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing(args.log_dir.as_deref(), args.log_to_stderr)?;

    info!(
        listen_addr = %args.listen_addr,
        config = %args.config.display(),
        "snapdeck starting"
    );
    let config = load_config(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    let context = Arc::new(build_context(config)?);
    let app = api::router(Arc::clone(&context));

    let listener = TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", args.listen_addr))?;
    info!(addr = %args.listen_addr, "snapdeck listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await?;
    info!("snapdeck shutting down");
    context.terminate_running().await;
    Ok(())
}

async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
