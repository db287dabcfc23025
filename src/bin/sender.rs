//! Webcam Sender Application
//!
//! Captures a local camera and serves it as MJPEG on the LAN, answering
//! discovery broadcasts from receivers.

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam::channel::{bounded, RecvTimeoutError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use webcam_share::{
    capture::{CameraSelector, CaptureBackend, DeviceRegistry, SyntheticBackend},
    config::AppConfig,
    session::{SenderSession, StreamingState},
};

/// Share a local webcam over the LAN
#[derive(Parser, Debug)]
#[command(name = "sender", version, about)]
struct Args {
    /// List cameras and exit
    #[arg(long)]
    list: bool,

    /// Camera key from --list, or a numeric device index
    #[arg(long)]
    camera: Option<String>,

    /// MJPEG server port
    #[arg(long)]
    port: Option<u16>,

    /// JPEG quality (1-100)
    #[arg(long)]
    quality: Option<u8>,

    /// Frames per second served to each client
    #[arg(long)]
    fps: Option<u32>,

    /// Name shown to receivers during discovery
    #[arg(long)]
    name: Option<String>,

    /// Serve a generated test pattern instead of a camera
    #[arg(long)]
    synthetic: bool,

    /// Config file (defaults to the per-user config)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref()).context("loading config")?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(quality) = args.quality {
        config.capture.jpeg_quality = quality.clamp(1, 100);
    }
    if let Some(fps) = args.fps {
        config.server.target_fps = fps.max(1);
    }
    if let Some(name) = args.name.clone() {
        config.server.name = name;
    }

    tracing::info!("Starting Webcam Sender");

    let registry = if args.synthetic {
        let backend: Arc<dyn CaptureBackend> = Arc::new(SyntheticBackend::test_pattern(
            640,
            480,
            config.server.target_fps,
        ));
        DeviceRegistry::new(vec![backend], config.capture.clone())
    } else {
        DeviceRegistry::system(config.capture.clone())
    };
    let registry = Arc::new(registry);

    // List cameras
    let snapshot = registry.snapshot();
    println!("\n=== Cameras ===");
    if snapshot.cameras.is_empty() {
        println!("  (none available)");
    }
    for camera in &snapshot.cameras {
        println!("  {}", camera.display_label());
        for candidate in camera.ordered_candidates() {
            println!(
                "    {} #{} (confidence {})",
                candidate.backend, candidate.index, candidate.confidence
            );
        }
    }
    if !snapshot.diagnostics.is_empty() {
        println!("\n=== Unavailable ===");
        for camera in &snapshot.diagnostics {
            println!(
                "  {} - {}{}",
                camera.display_label(),
                camera.availability,
                camera
                    .last_error
                    .as_deref()
                    .map(|e| format!(": {}", e))
                    .unwrap_or_default()
            );
        }
    }
    println!();

    if args.list {
        return Ok(());
    }

    let selector = match args.camera.as_deref() {
        Some(text) => text.parse::<CameraSelector>()?,
        None => match snapshot.cameras.first() {
            Some(camera) => CameraSelector::Key(camera.key.clone()),
            None => bail!("no camera available; try --synthetic"),
        },
    };

    let session = SenderSession::new(registry, config);
    session.start(selector)?;

    let (stop_tx, stop_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("installing Ctrl-C handler")?;

    tracing::info!("Running - press Ctrl+C to stop");

    let mut seen_revision = u64::MAX;
    let mut was_started = false;
    let mut last_stats = Instant::now();

    loop {
        match stop_rx.recv_timeout(Duration::from_millis(250)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let status = session.status();
        if status.revision != seen_revision {
            seen_revision = status.revision;
            println!("[{}] {}", status.state, status.message);
        }

        match status.state {
            StreamingState::Started => was_started = true,
            StreamingState::Stopped if !was_started => bail!("{}", status.message),
            StreamingState::Stopped => break,
            _ => {}
        }

        // Print stats periodically
        if last_stats.elapsed() >= Duration::from_secs(10) && was_started {
            last_stats = Instant::now();
            tracing::info!(
                "{} client(s) watching {}",
                session.client_count(),
                session.stream_url().unwrap_or_default()
            );
        }
    }

    session.stop();
    tracing::info!("Sender stopped");
    Ok(())
}
