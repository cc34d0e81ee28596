//! udev monitoring sessions

use devwatch_core::{DeviceAction, MonitorEvent, MonitorScope, MonitorSession, WatchError};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::device::describe;
use crate::tree::UdevTree;

/// Netlink subscription to udev events
///
/// The underlying socket is non-blocking; it is closed when dropped.
pub struct UdevMonitor {
    socket: udev::MonitorSocket,
    tree: Arc<UdevTree>,
}

impl UdevMonitor {
    pub(crate) fn open(
        _udev: udev::Udev,
        scope: &MonitorScope,
        tree: Arc<UdevTree>,
    ) -> Result<Self, WatchError> {
        let connection_error =
            |e: std::io::Error| WatchError::Connection(format!("cannot open udev monitor: {e}"));

        // `MonitorBuilder::with_udev` is crate-private in udev 0.9; `new` builds the
        // same udev-source monitor on its own context
        let mut builder = udev::MonitorBuilder::new().map_err(connection_error)?;
        match (&scope.subsystem, &scope.devtype) {
            (Some(subsystem), Some(devtype)) => {
                builder = builder
                    .match_subsystem_devtype(subsystem, devtype)
                    .map_err(connection_error)?;
            }
            (Some(subsystem), None) => {
                builder = builder.match_subsystem(subsystem).map_err(connection_error)?;
            }
            (None, Some(devtype)) => {
                // libudev cannot match a devtype alone, the filter re-checks it
                debug!(devtype = %devtype, "Monitoring all subsystems for devtype");
            }
            (None, None) => {}
        }

        let socket = builder.listen().map_err(connection_error)?;
        Ok(Self { socket, tree })
    }
}

impl AsRawFd for UdevMonitor {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

// SAFETY: the netlink socket is owned by the monitor and closed only on drop
unsafe impl MonitorSession for UdevMonitor {
    fn next_event(&mut self) -> Result<Option<MonitorEvent>, WatchError> {
        // libudev returns nothing once the socket would block
        let Some(event) = self.socket.iter().next() else {
            return Ok(None);
        };

        let action = match event.event_type() {
            udev::EventType::Add => DeviceAction::Add,
            udev::EventType::Remove => DeviceAction::Remove,
            udev::EventType::Change => DeviceAction::Change,
            udev::EventType::Bind => DeviceAction::Bind,
            udev::EventType::Unbind => DeviceAction::Unbind,
            other => {
                warn!(action = ?other, "Unrecognized udev event type");
                DeviceAction::Other
            }
        };

        let device = describe(&event.device(), Some(event.sequence_number()), self.tree.clone());
        Ok(Some(MonitorEvent { action, device }))
    }
}
