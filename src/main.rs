// src/main.rs

mod blob_tracker;
mod broadcaster;
mod config;
mod detection_gate;
mod detector;
mod error;
mod frame_buffer;
mod inference;
mod motion_analyzer;
mod pipeline;
mod semantic_tracker;
mod stream_source;
mod types;

use anyhow::Result;
use broadcaster::StreamBroadcaster;
use pipeline::PipelineMetrics;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = types::Config::load(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "vigil={},ort=warn",
                    config.logging.level
                ))
            }),
        )
        .init();

    info!("👁  Vigil — live stream motion & object tracking");
    info!("✓ Configuration loaded from {}", config_path);
    info!(
        "Gate: motion>={:.2}%, forced every {} frames | Tracker: stable={}, max_lost={}",
        config.gate.motion_gate_threshold,
        config.gate.periodic_interval,
        config.tracker.min_stable_frames,
        config.tracker.max_lost_frames,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(PipelineMetrics::new());

    // The broadcaster lives in its own thread group; inference latency on
    // the primary path cannot touch it.
    let (wire, broadcaster_handle) = if config.broadcast.enabled {
        let (sender, handle) = StreamBroadcaster::spawn(config.clone(), shutdown_rx.clone());
        info!("✓ Broadcaster started on {}", config.broadcast.bind_addr);
        (Some(sender), Some(handle))
    } else {
        info!("⚪ Broadcaster disabled in config");
        (None, None)
    };

    let mut pipeline = tokio::spawn(pipeline::run_pipeline(
        config.clone(),
        Arc::clone(&metrics),
        wire,
        shutdown_rx,
    ));

    let pipeline_result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
            pipeline.await
        }
        result = &mut pipeline => {
            let _ = shutdown_tx.send(true);
            result
        }
    };

    match pipeline_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Pipeline error: {:#}", e),
        Err(e) => error!("Pipeline task failed: {}", e),
    }

    if let Some(handle) = broadcaster_handle {
        let _ = handle.join();
    }

    metrics.report();
    info!("✓ Shutdown complete");
    Ok(())
}
