//! Webcam Receiver Application
//!
//! Finds senders on the LAN, pulls their MJPEG stream and republishes it as
//! a local virtual camera. Also manages the custom camera driver.

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use crossbeam::channel::{bounded, RecvTimeoutError};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use webcam_share::{
    config::AppConfig,
    session::{ConnectTarget, ConnectionState, ReceiverSession},
    virtualcam::{driver, DriverLocator},
};

/// Receive a shared webcam and expose it as a virtual camera
#[derive(Parser, Debug)]
#[command(name = "receiver", version, about)]
struct Cli {
    /// Config file (defaults to the per-user config)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to a sender and feed the virtual camera until Ctrl+C
    Connect(ConnectArgs),
    /// List senders on the LAN
    Discover {
        /// Listening window in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Manage the custom virtual camera driver
    Driver {
        #[command(subcommand)]
        action: DriverAction,
    },
}

#[derive(ClapArgs, Debug)]
#[group(required = true, multiple = false)]
struct ConnectArgs {
    /// Sender IP or host name, on the configured port
    #[arg(long)]
    ip: Option<String>,

    /// Full stream URL
    #[arg(long)]
    url: Option<String>,

    /// Connect to the first sender that answers discovery
    #[arg(long)]
    discover: bool,
}

#[derive(Subcommand, Debug)]
enum DriverAction {
    /// Show registration diagnostics
    Status,
    /// Register the driver (prompts for elevation)
    Install,
    /// Unregister the driver (prompts for elevation)
    Uninstall,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref()).context("loading config")?;

    match cli.command {
        Command::Discover { timeout_ms } => {
            if let Some(ms) = timeout_ms {
                config.discovery.timeout_ms = ms;
            }
            discover(config)
        }
        Command::Driver { action } => manage_driver(&config, action),
        Command::Connect(args) => connect(config, args),
    }
}

fn discover(config: AppConfig) -> Result<()> {
    let session = ReceiverSession::new(config);
    let servers = session.discover()?;

    println!("\n=== Senders ===");
    if servers.is_empty() {
        println!("  (none answered)");
    }
    for server in &servers {
        println!("  {}", server.display_label());
        println!("    {}", server.stream_url());
    }
    println!();
    Ok(())
}

fn manage_driver(config: &AppConfig, action: DriverAction) -> Result<()> {
    let locator = DriverLocator::from_config(&config.virtual_camera);

    match action {
        DriverAction::Status => {
            let status = driver::diagnose(&locator);
            println!("status:     {}", status.code);
            println!(
                "module:     {}",
                status
                    .dll_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "-".into())
            );
            println!(
                "registered: {}",
                status.registered_path.as_deref().unwrap_or("-")
            );
            println!("{}", status.message);
            Ok(())
        }
        DriverAction::Install | DriverAction::Uninstall => {
            let result = match action {
                DriverAction::Install => driver::install(&locator),
                _ => driver::uninstall(&locator),
            };
            println!("{}", result.message);
            if !result.ok {
                bail!("driver action failed ({})", result.code);
            }
            Ok(())
        }
    }
}

fn connect(config: AppConfig, args: ConnectArgs) -> Result<()> {
    let session = ReceiverSession::new(config);

    let target = if let Some(url) = args.url {
        ConnectTarget::Url(url)
    } else if let Some(ip) = args.ip {
        ConnectTarget::Host(ip)
    } else {
        tracing::info!("Looking for senders...");
        let Some(server) = session.discover()?.into_iter().next() else {
            bail!("no sender answered discovery");
        };
        println!("Found {}", server.display_label());
        session.select_server(server.clone())?;
        ConnectTarget::Server(server)
    };

    session.connect(target)?;

    let (stop_tx, stop_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("installing Ctrl-C handler")?;

    tracing::info!("Running - press Ctrl+C to stop");

    let mut seen_revision = u64::MAX;
    let mut reported_sink = None;
    let mut was_connected = false;

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

        let sink = session.sink_session();
        let sink_id = sink.as_ref().map(|s| s.session_id);
        if sink_id != reported_sink {
            reported_sink = sink_id;
            if let Some(sink) = sink {
                println!(
                    "Virtual camera {} at {}x{} ({:?})",
                    sink.device, sink.format.width, sink.format.height, sink.kind
                );
            }
        }

        match status.state {
            ConnectionState::Connected => was_connected = true,
            ConnectionState::Disconnected if !was_connected => bail!("{}", status.message),
            ConnectionState::Disconnected => break,
            ConnectionState::Connecting => {}
        }
    }

    session.disconnect();
    tracing::info!("Receiver stopped");
    Ok(())
}
