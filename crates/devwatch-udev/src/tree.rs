//! Device tree traversal through sysfs

use devwatch_core::{Description, DeviceTree, WatchError};
use std::path::Path;
use std::sync::Arc;

use crate::device::describe;

/// Parent/descendant lookups, each opening its own udev context
#[derive(Debug, Clone, Copy, Default)]
pub struct UdevTree;

impl UdevTree {
    fn open(syspath: &Path) -> Result<udev::Device, WatchError> {
        udev::Device::from_syspath(syspath).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WatchError::NotFound(format!("{} is gone", syspath.display()))
            } else {
                WatchError::Io(e)
            }
        })
    }
}

impl DeviceTree for UdevTree {
    fn parent(&self, syspath: &Path) -> Result<Option<Description>, WatchError> {
        let device = Self::open(syspath)?;
        Ok(device
            .parent()
            .map(|parent| describe(&parent, None, Arc::new(UdevTree))))
    }

    fn descendants(
        &self,
        syspath: &Path,
        subsystem: &str,
    ) -> Result<Vec<Description>, WatchError> {
        let device = Self::open(syspath)?;
        let enumeration_error = |e: std::io::Error| WatchError::Enumeration(e.to_string());

        let mut enumerator = udev::Enumerator::new().map_err(enumeration_error)?;
        enumerator.match_parent(&device).map_err(enumeration_error)?;
        enumerator
            .match_subsystem(subsystem)
            .map_err(enumeration_error)?;

        // match_parent includes the parent itself
        Ok(enumerator
            .scan_devices()
            .map_err(enumeration_error)?
            .filter(|child| child.syspath() != syspath)
            .map(|child| describe(&child, None, Arc::new(UdevTree)))
            .collect())
    }
}
