//! `rkvol`: volume plugin daemon mapping named volumes to Azure File shares.

mod cli;
mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use libvolume::{PluginServer, VolumeCoordinator};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::{Args, LogFormat};

fn init_tracing(args: &Args) {
    let default = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    match args.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(error = %e, "failed to register SIGTERM handler");
            None
        }
    };
    let terminate = async {
        match sigterm.as_mut() {
            Some(s) => {
                s.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received interrupt"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    config::ensure_root(nix::unistd::getuid())?;
    let driver_config = config::driver_config(&args)?;
    info!(
        account = %driver_config.account_name,
        storage_base = %driver_config.storage_base,
        mount_root = %driver_config.mount_root.display(),
        metadata_root = %driver_config.metadata_root.display(),
        remove_shares = driver_config.remove_shares,
        "starting volume driver"
    );

    let coordinator = VolumeCoordinator::from_config(driver_config)
        .await
        .context("failed to initialize volume driver")?;
    let server = PluginServer::bind(
        &args.plugin_name,
        &config::listen_addr(&args),
        Arc::new(coordinator),
    )
    .await
    .context("failed to start plugin server")?;

    server.serve(shutdown_signal()).await;
    info!("volume driver stopped");
    Ok(())
}
