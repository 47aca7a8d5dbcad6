//! AmbiSample - camera-driven Ambilight border sampling
//!
//! This application watches a TV through a USB camera, splits the border of
//! the calibrated screen area into a ring of sampling windows, averages each
//! window's color on a fixed cadence and serves the colors over HTTP for an
//! ambient lighting controller.

mod calibration;
mod capture;
mod color;
mod config;
mod frame;
mod geometry;
mod sampler;
mod server;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::calibration::{AmbilightConfig, WorkingSpace};
use crate::sampler::SamplingEngine;

/// AmbiSample - Ambilight colors from a camera pointed at the TV
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Sample a still image instead of the camera
    #[arg(short, long)]
    image: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("AmbiSample v{}", env!("CARGO_PKG_VERSION"));

    let config = config::Config::load_or_create(&args.config)?;

    info!(
        "Working resolution: {}x{}, presentation space {}x{}",
        config.video.working_width,
        config.video.working_height,
        config.sampling.presentation_width,
        config.sampling.presentation_height
    );
    info!(
        "Segments: {}x{}, averaging: {}",
        config.sampling.h_segments,
        config.sampling.v_segments,
        config.sampling.averaging.as_str()
    );

    let engine = Arc::new(SamplingEngine::new(
        AmbilightConfig::from_settings(&config),
        WorkingSpace::from_config(&config),
    ));

    let snapshot = Arc::new(capture::SnapshotSlot::default());
    let source = capture::open_source(&config, args.image.as_deref(), snapshot.clone())?;
    let description = source.describe();
    let cadence = Duration::from_millis(config.sampling.cadence_ms.max(1));
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let config = Arc::new(parking_lot::RwLock::new(config));
    let state = Arc::new(server::AppState::new(
        engine.clone(),
        config,
        args.config.clone(),
        description,
        snapshot,
    ));

    // Sampling runs on a blocking thread, it sleeps between cycles
    let loop_engine = engine.clone();
    let sampling_handle = tokio::task::spawn_blocking(move || {
        sampler::run_sampling_loop(loop_engine, source, cadence)
    });

    info!("Starting web server at http://{}", addr);
    let server_handle = tokio::spawn(async move { server::run_server(&addr, state).await });

    tokio::select! {
        result = sampling_handle => {
            match result {
                Ok(Ok(())) => info!("Sampling loop exited normally"),
                Ok(Err(e)) => tracing::error!("Sampling loop error: {}", e),
                Err(e) => tracing::error!("Sampling task panicked: {}", e),
            }
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => tracing::error!("Server error: {}", e),
                Err(e) => tracing::error!("Server task panicked: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
        }
    }

    engine.shutdown();
    Ok(())
}
