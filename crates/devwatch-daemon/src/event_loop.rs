//! Daemon event loop
//!
//! Runs the watcher and the lifecycle service on a single task: the initial
//! scan, then monitor ticks and manager stop notifications until shutdown.

use anyhow::{Context, Result};
use devwatch_core::{DeviceFilter, DeviceWatcher, Subsystem};
use std::future::Future;
use tracing::{debug, info};

use crate::config::DaemonConfig;
use crate::service::{DeviceOpener, Service};

/// Drive `watcher` and `service` until auto-quit or `shutdown` completes
///
/// On exit the watcher is deactivated and remaining managers are closed
/// without removal notifications.
pub async fn run<S, F, O>(
    watcher: &mut DeviceWatcher<S, F>,
    service: &mut Service<O>,
    options: &DaemonConfig,
    shutdown: impl Future<Output = ()>,
) -> Result<()>
where
    S: Subsystem,
    F: DeviceFilter,
    O: DeviceOpener,
{
    let mut events = watcher.subscribe();
    tokio::pin!(shutdown);

    if options.scan_on_start {
        watcher.scan().context("Initial device scan failed")?;
    }
    if options.monitor {
        watcher
            .set_active(true)
            .context("Cannot start device monitoring")?;
    }

    let result = loop {
        while let Ok(event) = events.try_recv() {
            service.handle_event(event);
        }
        if service.quit_requested() {
            info!("Last device removed, shutting down");
            break Ok(());
        }

        tokio::select! {
            tick = watcher.process_monitor() => {
                match tick {
                    Ok(emitted) => debug!(emitted, "Monitor tick"),
                    Err(e) => break Err(e).context("Device monitoring failed"),
                }
            }
            Some(stopped) = service.next_stopped() => {
                service.on_manager_stopped(&stopped);
            }
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break Ok(());
            }
        }
    };

    watcher.set_active(false)?;
    if !service.is_empty() {
        let devpaths: Vec<&str> = service.devpaths().collect();
        debug!(?devpaths, "Devices still managed at exit");
    }
    service.clear();
    result
}
