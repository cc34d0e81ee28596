//! Conversion of libudev devices into descriptions

use devwatch_core::{Description, DeviceTree, NativeDevice};
use std::ffi::OsStr;
use std::sync::Arc;

use crate::tree::UdevTree;

/// Device returned by a udev enumeration pass
pub struct UdevDevice {
    device: udev::Device,
    tree: Arc<UdevTree>,
}

impl UdevDevice {
    pub(crate) fn new(device: udev::Device, tree: Arc<UdevTree>) -> Self {
        Self { device, tree }
    }
}

impl NativeDevice for UdevDevice {
    fn devpath(&self) -> String {
        lossy(self.device.devpath())
    }

    fn describe(&self) -> Description {
        describe(&self.device, None, self.tree.clone())
    }
}

/// Snapshot a libudev device, reading all of its properties and attributes
///
/// `seqnum` overrides the SEQNUM property, which only monitor events carry.
pub fn describe(device: &udev::Device, seqnum: Option<u64>, tree: Arc<dyn DeviceTree>) -> Description {
    let mut builder = Description::builder(lossy(device.devpath()))
        .syspath(device.syspath())
        .sysname(lossy(device.sysname()))
        .initialized(device.is_initialized())
        .tree(tree);

    if let Some(subsystem) = device.subsystem() {
        builder = builder.subsystem(lossy(subsystem));
    }
    if let Some(devtype) = device.devtype() {
        builder = builder.devtype(lossy(devtype));
    }
    if let Some(sysnum) = device.sysnum() {
        builder = builder.sysnum(sysnum.to_string());
    }
    if let Some(devnode) = device.devnode() {
        builder = builder.devnode(devnode);
    }
    if let Some(driver) = device.driver() {
        builder = builder.driver(lossy(driver));
    }

    let seqnum = seqnum.or_else(|| parse_u64(device.property_value("SEQNUM")));
    let usec = parse_u64(device.property_value("USEC_INITIALIZED"))
        .map(usec_since)
        .unwrap_or(0);
    builder = builder.seqnum(seqnum.unwrap_or(0)).usec_since_initialized(usec);

    for tag in device
        .property_value("TAGS")
        .map(|tags| parse_tags(&lossy(tags)))
        .unwrap_or_default()
    {
        builder = builder.tag(tag);
    }

    for entry in device.properties() {
        builder = builder.property(lossy(entry.name()), lossy(entry.value()));
    }

    // Attribute values are read from sysfs one by one; unreadable ones are skipped
    for entry in device.attributes() {
        let name = entry.name();
        if let Some(value) = device.attribute_value(name) {
            builder = builder.attribute(lossy(name), lossy(value).trim_end().to_string());
        }
    }

    builder.build()
}

/// Time elapsed since a CLOCK_MONOTONIC timestamp, the clock udev stamps
/// USEC_INITIALIZED with
fn usec_since(usec_initialized: u64) -> u64 {
    monotonic_usec().saturating_sub(usec_initialized)
}

fn monotonic_usec() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid, writable timespec
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } != 0 {
        return 0;
    }
    (ts.tv_sec as u64) * 1_000_000 + (ts.tv_nsec as u64) / 1_000
}

fn lossy(value: &OsStr) -> String {
    value.to_string_lossy().into_owned()
}

fn parse_u64(value: Option<&OsStr>) -> Option<u64> {
    value.and_then(|v| v.to_str()).and_then(|v| v.trim().parse().ok())
}

/// Split a udev tag list (":seat:uaccess:") into tags, keeping order
pub(crate) fn parse_tags(tags: &str) -> Vec<String> {
    tags.split(':')
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}
