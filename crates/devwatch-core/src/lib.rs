//! Devwatch Core - Device descriptions, filtering and hot-plug watching
//!
//! This crate provides the device observation layer of devwatch:
//! - Immutable device descriptions snapshotted from the host device subsystem
//! - Filter strategies deciding which devices are visible
//! - A watcher that diffs enumeration passes and monitor events into
//!   added/removed notifications
//! - Backend traits implemented by concrete device subsystems (udev)

pub mod description;
pub mod error;
pub mod filter;
pub mod subsystem;
pub mod watcher;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use description::{Description, DescriptionBuilder};
pub use error::WatchError;
pub use filter::{AcceptAll, DeviceFilter, MatchRules};
pub use subsystem::{
    DeviceAction, DeviceTree, EnumerationScope, MonitorEvent, MonitorScope, MonitorSession,
    NativeDevice, Subsystem,
};
pub use watcher::{DeviceWatcher, FilteredDeviceWatcher, ScanReport, WatchEvent};
