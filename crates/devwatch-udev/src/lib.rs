//! Devwatch udev - libudev backend for the device watcher
//!
//! This crate connects the watcher to the Linux device subsystem:
//! - Enumeration with native subsystem/property/tag matching
//! - Netlink monitoring sessions usable with the tokio reactor
//! - Parent/descendant traversal of the sysfs device tree

pub mod device;
pub mod monitor;
pub mod tree;

pub use device::{describe, UdevDevice};
pub use monitor::UdevMonitor;
pub use tree::UdevTree;

use devwatch_core::{EnumerationScope, MonitorScope, Subsystem, WatchError};
use std::sync::Arc;
use tracing::debug;

/// Connection to udev
pub struct UdevSubsystem {
    udev: udev::Udev,
    tree: Arc<UdevTree>,
}

impl UdevSubsystem {
    /// Open a connection to udev
    pub fn open() -> Result<Self, WatchError> {
        let udev = udev::Udev::new()
            .map_err(|e| WatchError::Connection(format!("cannot create udev context: {e}")))?;
        Ok(Self {
            udev,
            tree: Arc::new(UdevTree),
        })
    }
}

impl Subsystem for UdevSubsystem {
    type Device = UdevDevice;
    type Monitor = UdevMonitor;

    fn enumerate(&self, scope: &EnumerationScope) -> Result<Vec<Self::Device>, WatchError> {
        let enumeration_error = |e: std::io::Error| WatchError::Enumeration(e.to_string());

        let mut enumerator =
            udev::Enumerator::with_udev(self.udev.clone()).map_err(enumeration_error)?;
        if let Some(subsystem) = &scope.subsystem {
            enumerator.match_subsystem(subsystem).map_err(enumeration_error)?;
        }
        // libudev ORs property matches together, which is still a superset
        // of the devices the filter will accept
        if let Some(devtype) = &scope.devtype {
            enumerator
                .match_property("DEVTYPE", devtype)
                .map_err(enumeration_error)?;
        }
        for (name, value) in &scope.properties {
            enumerator
                .match_property(name, value)
                .map_err(enumeration_error)?;
        }
        for tag in &scope.tags {
            enumerator.match_tag(tag).map_err(enumeration_error)?;
        }

        let devices: Vec<UdevDevice> = enumerator
            .scan_devices()
            .map_err(enumeration_error)?
            .map(|device| UdevDevice::new(device, self.tree.clone()))
            .collect();
        debug!(count = devices.len(), "udev enumeration complete");
        Ok(devices)
    }

    fn open_monitor(&self, scope: &MonitorScope) -> Result<Self::Monitor, WatchError> {
        UdevMonitor::open(self.udev.clone(), scope, self.tree.clone())
    }
}
