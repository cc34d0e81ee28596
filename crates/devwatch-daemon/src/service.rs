//! Device lifecycle service
//!
//! Turns watcher events into device managers: every added device is handed
//! to a [`DeviceOpener`], and the resulting manager is kept in a directory
//! keyed by devpath until the device is removed or the manager stops.

use devwatch_core::{Description, WatchEvent};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::config::ServiceConfig;

#[derive(Error, Debug)]
pub enum OpenError {
    /// The device is not of the kind this daemon handles
    #[error("Device {0} is not supported")]
    Incompatible(String),
    #[error("Device {0} has no device node")]
    MissingNode(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Open failed: {0}")]
    Failed(String),
}

impl OpenError {
    /// Whether the failure only means the device is not one of ours
    pub fn is_incompatible(&self) -> bool {
        matches!(self, Self::Incompatible(_) | Self::MissingNode(_))
    }
}

/// Factory turning device descriptions into open device handles
///
/// The handle receives a [`StopNotifier`] to report that it has stopped
/// working, which removes its manager as if the device had been unplugged.
pub trait DeviceOpener {
    type Handle;

    fn open(
        &self,
        description: &Description,
        stopper: StopNotifier,
    ) -> Result<Self::Handle, OpenError>;
}

/// Lifecycle notifications emitted by the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServiceEvent {
    ManagerAdded {
        devpath: String,
        devnode: Option<PathBuf>,
    },
    ManagerRemoved {
        devpath: String,
    },
    /// The last device went away and auto-quit is enabled
    QuitRequested,
}

/// A manager's report that it stopped
///
/// The generation identifies the manager instance, so a report that is
/// still queued when its device is removed and re-added does not affect
/// the new manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    devpath: String,
    generation: u64,
}

impl StopReport {
    pub fn devpath(&self) -> &str {
        &self.devpath
    }
}

/// Reports a manager as stopped back to the service
#[derive(Debug)]
pub struct StopNotifier {
    report: StopReport,
    tx: mpsc::UnboundedSender<StopReport>,
}

impl StopNotifier {
    pub fn notify(&self) {
        let _ = self.tx.send(self.report.clone());
    }

    /// Notifier wired to a standalone channel
    #[cfg(test)]
    pub fn detached(devpath: &str) -> (Self, mpsc::UnboundedReceiver<StopReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let notifier = Self {
            report: StopReport {
                devpath: devpath.to_string(),
                generation: 0,
            },
            tx,
        };
        (notifier, rx)
    }
}

/// An opened device together with the description it was opened from
struct DeviceManager<H> {
    description: Description,
    handle: H,
    generation: u64,
}

/// Directory of device managers driven by watcher events
pub struct Service<O: DeviceOpener> {
    opener: O,
    config: ServiceConfig,
    managers: HashMap<String, DeviceManager<O::Handle>>,
    events: broadcast::Sender<ServiceEvent>,
    stopped_tx: mpsc::UnboundedSender<StopReport>,
    stopped_rx: mpsc::UnboundedReceiver<StopReport>,
    next_generation: u64,
    quit: bool,
}

impl<O: DeviceOpener> Service<O> {
    pub fn new(opener: O, config: ServiceConfig) -> Self {
        let (events, _) = broadcast::channel(100);
        let (stopped_tx, stopped_rx) = mpsc::unbounded_channel();
        Self {
            opener,
            config,
            managers: HashMap::new(),
            events,
            stopped_tx,
            stopped_rx,
            next_generation: 0,
            quit: false,
        }
    }

    /// Subscribe to lifecycle notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    /// Devpaths of every managed device, in no particular order
    pub fn devpaths(&self) -> impl Iterator<Item = &str> {
        self.managers.keys().map(|k| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    /// Whether the last device went away with auto-quit enabled
    pub fn quit_requested(&self) -> bool {
        self.quit
    }

    pub fn handle_event(&mut self, event: WatchEvent) {
        match event {
            WatchEvent::Added(description) => self.on_device_added(description),
            WatchEvent::Removed(description) => self.on_device_removed(&description),
        }
    }

    /// Try to open a newly added device; failures drop the event
    pub fn on_device_added(&mut self, description: Description) {
        if self.managers.contains_key(description.devpath()) {
            debug!(devpath = %description.devpath(), "Device already managed");
            return;
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let stopper = StopNotifier {
            report: StopReport {
                devpath: description.devpath().to_string(),
                generation,
            },
            tx: self.stopped_tx.clone(),
        };

        let handle = match self.opener.open(&description, stopper) {
            Ok(handle) => handle,
            Err(e) if e.is_incompatible() => {
                trace!(devpath = %description.devpath(), error = %e, "Skipping device");
                return;
            }
            Err(e) => {
                warn!(
                    devnode = %description.devnode().map(|p| p.display().to_string()).unwrap_or_default(),
                    error = %e,
                    "Not opening device"
                );
                return;
            }
        };

        let devpath = description.devpath().to_string();
        let devnode = description.devnode().map(|p| p.to_path_buf());
        info!(
            devnode = %devnode.as_ref().map(|p| p.display().to_string()).unwrap_or_default(),
            driver = description.driver().unwrap_or("none"),
            sysname = %description.sysname(),
            "Opened device"
        );

        let manager = DeviceManager {
            description,
            handle,
            generation,
        };
        self.managers.insert(devpath.clone(), manager);
        let _ = self
            .events
            .send(ServiceEvent::ManagerAdded { devpath, devnode });
    }

    pub fn on_device_removed(&mut self, description: &Description) {
        self.remove_manager(description.devpath());
    }

    /// A manager reported that it stopped; treat it like a removal
    pub fn on_manager_stopped(&mut self, stopped: &StopReport) {
        let current = self
            .managers
            .get(stopped.devpath())
            .map(|manager| manager.generation);
        if current != Some(stopped.generation) {
            debug!(devpath = %stopped.devpath(), "Ignoring stop report from a closed manager");
            return;
        }
        debug!(devpath = %stopped.devpath(), "Device manager stopped");
        self.remove_manager(stopped.devpath());
    }

    /// Wait for the next manager to report itself stopped
    pub async fn next_stopped(&mut self) -> Option<StopReport> {
        self.stopped_rx.recv().await
    }

    fn remove_manager(&mut self, devpath: &str) {
        let Some(DeviceManager {
            description,
            handle,
            ..
        }) = self.managers.remove(devpath)
        else {
            return;
        };
        info!(devpath = %devpath, sysname = %description.sysname(), "Removing device");
        drop(handle);
        let _ = self.events.send(ServiceEvent::ManagerRemoved {
            devpath: devpath.to_string(),
        });

        if self.managers.is_empty() && self.config.auto_quit {
            info!("No devices left, requesting shutdown");
            self.quit = true;
            let _ = self.events.send(ServiceEvent::QuitRequested);
        }
    }

    /// Drop every manager without emitting removal notifications
    pub fn clear(&mut self) {
        if !self.managers.is_empty() {
            debug!(count = self.managers.len(), "Closing remaining devices");
        }
        self.managers.clear();
    }
}
