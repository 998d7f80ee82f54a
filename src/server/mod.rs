// src/server/mod.rs

//! Builds the node's context, spawns its background tasks, and runs until
//! a shutdown signal or a critical task failure.

use crate::config::Config;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, reload};

mod context;
mod http;
mod initialization;
mod metrics_server;
mod spawner;

#[cfg(windows)]
use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Waits for a shutdown signal based on the operating system.
/// On Unix, it listens for SIGINT and SIGTERM.
/// On Windows, it listens for Ctrl+C.
async fn await_shutdown_signal() {
    #[cfg(unix)]
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to create SIGINT stream");
    #[cfg(unix)]
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to create SIGTERM stream");

    #[cfg(windows)]
    let mut ctrl_c = signal::ctrl_c().expect("Failed to create Ctrl+C stream");

    tokio::select! {
        _ = async { #[cfg(unix)] { sigint.recv().await; info!("SIGINT received, initiating graceful shutdown."); } } => {},
        _ = async { #[cfg(unix)] { sigterm.recv().await; info!("SIGTERM received, initiating graceful shutdown."); } } => {},
        _ = async { #[cfg(windows)] { ctrl_c.await; info!("Ctrl-C received, initiating graceful shutdown."); } } => {},
    }
}

/// The main server startup function: builds the context, spawns every
/// background task, then blocks until a shutdown signal arrives or a
/// critical task exits.
pub async fn run(
    config: Config,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<()> {
    let mut ctx = initialization::setup(config, log_reload_handle).await?;
    spawner::spawn_all(&mut ctx).await?;

    loop {
        tokio::select! {
            biased;

            _ = await_shutdown_signal() => {
                break;
            },

            Some(res) = ctx.background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => info!("a background task exited cleanly"),
                    Ok(Err(e)) => { error!("CRITICAL: background task failed: {e}. Shutting down."); break; }
                    Err(e) => { error!("CRITICAL: background task panicked: {e:?}. Shutting down."); break; }
                }
            },
        }
    }

    info!("shutting down. sending signal to all background tasks.");
    if ctx.shutdown_tx.send(()).is_err() {
        warn!("shutdown signal had no receivers; tasks may already be gone");
    }

    info!("waiting for background tasks to finish...");
    if tokio::time::timeout(Duration::from_secs(10), async {
        while ctx.background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("timed out waiting for background tasks to finish cleanly.");
    }
    info!("server shutdown complete.");

    Ok(())
}
