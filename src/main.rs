mod cluster;
mod config;
mod error;
mod ffmpeg;
mod geo;
mod group;
mod manifest;
mod model;
mod output;
mod photo;
mod pipeline;
mod video;
mod walker;

use crate::config::{AppConfig, Cli};
use crate::error::AppError;
use crate::pipeline::CancelFlag;
use anyhow::Result;
use clap::Parser;
use log::info;

/// Ctrl-C stops scheduling new files and kills running encodes.
fn cancel_on_interrupt(cancel: CancelFlag) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::warn!("Interrupt received, stopping...");
                cancel.cancel();
            }
            Err(e) => log::error!("Could not listen for interrupts: {}", e),
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::new(&cli)?;

    // Initialize env_logger based on config.log_level
    env_logger::Builder::new()
        .filter_level(config.log_level.parse().unwrap_or(log::LevelFilter::Info))
        .init();

    info!("Starting trip-indexer");

    let cancel = CancelFlag::new();
    cancel_on_interrupt(cancel.clone());

    // The run blocks on worker pools and child processes
    let result = tokio::task::spawn_blocking(move || pipeline::run(&config, &cancel))
        .await
        .map_err(AppError::from)
        .and_then(|result| result);

    match result {
        Ok(summary) => info!(
            "Trip {:?} written to {:?} with {} groups, {} failures",
            summary.trip.name,
            summary.manifest_path,
            summary.trip.groups.len(),
            summary.failures.len()
        ),
        Err(e) => log::error!("Run failed: {}", e),
    }

    info!("trip-indexer finished");

    Ok(())
}
