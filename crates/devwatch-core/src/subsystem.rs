//! Backend traits for the host device subsystem
//!
//! A backend provides four things: enumeration of present devices, a
//! non-blocking monitoring session whose file descriptor can be registered
//! with the event loop, a way to snapshot a native device into a
//! [`Description`], and tree traversal for topology queries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::os::fd::AsRawFd;
use std::path::Path;

use crate::description::Description;
use crate::error::WatchError;

/// Constraints applied when enumerating devices
///
/// Backends apply whatever they can filter natively. This is an optimization
/// only, every result is re-checked with the watcher's filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnumerationScope {
    pub subsystem: Option<String>,
    pub devtype: Option<String>,
    pub properties: BTreeMap<String, String>,
    pub tags: Vec<String>,
}

/// Constraints applied to a monitoring subscription
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorScope {
    pub subsystem: Option<String>,
    pub devtype: Option<String>,
}

impl MonitorScope {
    /// Whether a device falls inside this subscription
    pub fn matches(&self, dev: &Description) -> bool {
        let subsystem_ok = self
            .subsystem
            .as_deref()
            .map_or(true, |s| dev.subsystem() == Some(s));
        let devtype_ok = self
            .devtype
            .as_deref()
            .map_or(true, |t| dev.devtype() == Some(t));
        subsystem_ok && devtype_ok
    }
}

/// Kind of change reported by a monitoring session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceAction {
    Add,
    Remove,
    Change,
    Bind,
    Unbind,
    Other,
}

impl DeviceAction {
    /// Parse a kernel uevent action name
    pub fn from_name(name: &str) -> Self {
        match name {
            "add" => Self::Add,
            "remove" => Self::Remove,
            "change" => Self::Change,
            "bind" => Self::Bind,
            "unbind" => Self::Unbind,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for DeviceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Change => "change",
            Self::Bind => "bind",
            Self::Unbind => "unbind",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// One event read from a monitoring session
#[derive(Debug, Clone)]
pub struct MonitorEvent {
    pub action: DeviceAction,
    pub device: Description,
}

/// A device handle returned by enumeration
///
/// Describing a device is expensive (all properties and attributes are read),
/// so the watcher only calls [`NativeDevice::describe`] for devices it does
/// not know yet.
pub trait NativeDevice {
    fn devpath(&self) -> String;
    fn describe(&self) -> Description;
}

/// Connection to the host device subsystem
pub trait Subsystem {
    type Device: NativeDevice;
    type Monitor: MonitorSession;

    /// Enumerate devices currently present within `scope`
    fn enumerate(&self, scope: &EnumerationScope) -> Result<Vec<Self::Device>, WatchError>;

    /// Open a live subscription to hot-plug events within `scope`
    fn open_monitor(&self, scope: &MonitorScope) -> Result<Self::Monitor, WatchError>;
}

/// A live, non-blocking subscription to hot-plug events
///
/// # Safety
///
/// `as_raw_fd` must return the same open descriptor for as long as the
/// session exists. The watcher registers that descriptor with the tokio
/// reactor and relies on it staying valid until the session is dropped.
pub unsafe trait MonitorSession: AsRawFd {
    /// Read the next pending event, or `Ok(None)` if reading would block
    fn next_event(&mut self) -> Result<Option<MonitorEvent>, WatchError>;
}

/// Device tree traversal, shared by all descriptions from one backend
pub trait DeviceTree: Send + Sync {
    /// Immediate parent of the device at `syspath`, if any
    fn parent(&self, syspath: &Path) -> Result<Option<Description>, WatchError>;

    /// All descendants of the device at `syspath` in `subsystem`, at any depth
    fn descendants(&self, syspath: &Path, subsystem: &str)
        -> Result<Vec<Description>, WatchError>;
}
