//! Devwatch Daemon - Main entry point
//!
//! Watches the device subsystem for devices matching the configured rules
//! and keeps a device manager open for each of them.

mod config;
mod event_loop;
mod opener;
mod service;

use anyhow::{Context, Result};
use clap::Parser;
use devwatch_core::{Description, FilteredDeviceWatcher};
use devwatch_udev::UdevSubsystem;
use std::path::PathBuf;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::opener::NodeOpener;
use crate::service::{Service, ServiceEvent};

#[derive(Parser, Debug)]
#[command(name = "devwatchd")]
#[command(about = "Device hot-plug watcher and lifecycle daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "devwatch.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// List matching devices and exit
    #[arg(long)]
    scan_once: bool,

    /// Print JSON: the device list with --scan-once, lifecycle events otherwise
    #[arg(long)]
    json: bool,

    /// Do not follow hot-plug events after the initial scan
    #[arg(long)]
    no_monitor: bool,

    /// Exit once the last managed device is removed
    #[arg(long)]
    auto_quit: bool,

    /// Write an example configuration file to the given path and exit
    #[arg(long, value_name = "PATH")]
    write_default_config: Option<PathBuf>,
}

fn init_logging(log_level: &str) -> Result<()> {
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
        return Ok(());
    }

    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn print_devices(devices: &[&Description], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(devices)?);
        return Ok(());
    }

    println!("Found {} devices:", devices.len());
    for device in devices {
        println!("  - {}", device);
        println!(
            "    Subsystem: {}  Driver: {}",
            device.subsystem().unwrap_or("-"),
            device.driver().unwrap_or("-")
        );
        if let Some(model) = device.property("ID_MODEL") {
            println!("    Model: {}", model);
        }
    }
    Ok(())
}

/// Print lifecycle events as JSON lines until the service goes away
fn spawn_event_printer(mut events: broadcast::Receiver<ServiceEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!(error = %e, "Cannot encode lifecycle event"),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Lifecycle events dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level)?;

    info!("devwatchd v{}", env!("CARGO_PKG_VERSION"));

    if let Some(path) = &args.write_default_config {
        config::save_default_config(path)
            .with_context(|| format!("Cannot write {}", path.display()))?;
        println!("Wrote example configuration to {}", path.display());
        return Ok(());
    }

    // Load configuration
    let mut config = config::load_config(&args.config)?;

    if args.no_monitor {
        config.daemon.monitor = false;
    }
    if args.auto_quit {
        config.service.auto_quit = true;
    }

    info!(
        subsystem = config.filter.subsystem.as_deref().unwrap_or("*"),
        devtype = config.filter.devtype.as_deref().unwrap_or("*"),
        auto_quit = config.service.auto_quit,
        "Configuration loaded"
    );

    let subsystem = UdevSubsystem::open()?;
    let mut watcher = FilteredDeviceWatcher::with_filter(subsystem, config.filter.clone());

    if args.scan_once {
        watcher.scan()?;
        let mut devices: Vec<&Description> = watcher.known().collect();
        devices.sort_by(|a, b| a.devpath().cmp(b.devpath()));
        return print_devices(&devices, args.json);
    }

    let mut service = Service::new(NodeOpener::new(config.device.clone()), config.service.clone());
    let printer = args.json.then(|| spawn_event_printer(service.subscribe()));
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    let result = event_loop::run(&mut watcher, &mut service, &config.daemon, shutdown).await;

    // Dropping the service closes the event channel, which ends the printer
    drop(service);
    if let Some(printer) = printer {
        let _ = printer.await;
    }
    result
}
