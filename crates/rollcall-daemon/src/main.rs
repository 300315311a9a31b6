//! Rollcall Daemon - Main entry point
//!
//! Serves the discovery API, or runs a single sweep and prints the result.

mod api;
mod config;
mod server;
mod state;

use anyhow::Result;
use clap::Parser;
use rollcall_discovery::SessionStatus;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "rollcall")]
#[command(about = "LAN device discovery daemon for attendance terminals")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "rollcall.toml")]
    config: PathBuf,

    /// Bind address for the API server
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Run a single DHCP-range sweep and exit
    #[arg(long)]
    scan_once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let builder = FmtSubscriber::builder().with_target(true);
    if std::env::var_os("RUST_LOG").is_some() {
        tracing::subscriber::set_global_default(
            builder.with_env_filter(EnvFilter::from_default_env()).finish(),
        )?;
    } else {
        tracing::subscriber::set_global_default(builder.with_max_level(level).finish())?;
    }

    info!("Rollcall v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = config::load_config(&args.config)?;

    // Override bind address if specified
    if let Some(bind) = args.bind {
        config.daemon.bind = bind;
    }

    info!(
        cache = %config.storage.cache_path,
        settings = %config.storage.settings_path,
        batch_size = config.discovery.batch_size,
        "Configuration loaded"
    );

    let state = state::AppState::new(config.clone())?;

    if args.scan_once {
        let settings = state.service.network_settings();
        info!(
            start = %settings.ip_range_start,
            end = %settings.ip_range_end,
            "Running single discovery scan"
        );
        let id = state.service.start_dhcp_discovery()?;

        let session = loop {
            let session = state.service.progress(&id)?;
            if session.status.is_terminal() {
                break session;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        };

        if session.status == SessionStatus::Error {
            anyhow::bail!(
                "Discovery failed: {}",
                session.error.unwrap_or(session.message)
            );
        }

        println!("Discovered {} devices:", session.found_devices.len());
        for device in &session.found_devices {
            let name = device.custom_name.as_deref().unwrap_or(&device.hostname);
            println!(
                "  - {} ({}) at {} [{:?}]",
                name, device.mac_address, device.ip_address, device.discovery_method
            );
            if device.manufacturer != rollcall_core::device::UNKNOWN {
                println!("    Manufacturer: {}", device.manufacturer);
            }
        }
    } else {
        server::run(state, &config.daemon.bind).await?;
    }

    Ok(())
}
