//! Device node opener
//!
//! The daemon's device handle only holds the device node open; speaking the
//! device's protocol is left to whoever consumes the handle. While a node is
//! open, a watch task drains and discards what the device reports, and
//! stops the manager once the node hangs up or fails.

use devwatch_core::Description;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::PathBuf;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::DeviceConfig;
use crate::service::{DeviceOpener, OpenError, StopNotifier};

#[derive(Debug)]
enum NodeState {
    /// Polled by a watch task that owns the file
    Watched(JoinHandle<()>),
    /// The node cannot be polled, so it is only held open
    Held(File),
}

/// An open device node
#[derive(Debug)]
pub struct NodeHandle {
    devnode: PathBuf,
    state: NodeState,
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        match &self.state {
            NodeState::Watched(task) => task.abort(),
            NodeState::Held(file) => trace!(fd = file.as_raw_fd(), "Releasing unwatched node"),
        }
        debug!(devnode = %self.devnode.display(), "Device node closed");
    }
}

/// Opens the character device node of each added device
#[derive(Debug, Clone, Default)]
pub struct NodeOpener {
    config: DeviceConfig,
}

impl NodeOpener {
    pub fn new(config: DeviceConfig) -> Self {
        Self { config }
    }
}

impl DeviceOpener for NodeOpener {
    type Handle = NodeHandle;

    fn open(
        &self,
        description: &Description,
        stopper: StopNotifier,
    ) -> Result<NodeHandle, OpenError> {
        let path = description
            .devnode()
            .ok_or_else(|| OpenError::MissingNode(description.devpath().to_string()))?;

        let metadata = std::fs::metadata(path)?;
        if !metadata.file_type().is_char_device() {
            return Err(OpenError::Incompatible(path.display().to_string()));
        }

        if tokio::runtime::Handle::try_current().is_err() {
            return Err(OpenError::Failed(format!(
                "{}: device nodes are watched from the event loop",
                path.display()
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(!self.config.read_only)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| match e.kind() {
                ErrorKind::PermissionDenied => {
                    OpenError::Failed(format!("{}: permission denied", path.display()))
                }
                _ => OpenError::Io(e),
            })?;
        debug!(devnode = %path.display(), read_only = self.config.read_only, "Device node opened");

        let state = match spawn_watch(file, path.to_path_buf(), stopper) {
            Ok(task) => NodeState::Watched(task),
            Err((file, e)) => {
                debug!(devnode = %path.display(), error = %e, "Device node cannot be polled");
                NodeState::Held(file)
            }
        };

        Ok(NodeHandle {
            devnode: path.to_path_buf(),
            state,
        })
    }
}

/// Register a non-blocking node with the reactor and watch it in a task
///
/// On failure the node is handed back with the registration error.
fn spawn_watch<T>(
    node: T,
    devnode: PathBuf,
    stopper: StopNotifier,
) -> Result<JoinHandle<()>, (T, std::io::Error)>
where
    T: AsRawFd + Send + Sync + 'static,
    for<'a> &'a T: Read,
{
    // SAFETY: the node is moved into the AsyncFd, which owns its descriptor
    // until the watch task ends
    let node = unsafe { AsyncFd::register_with_interest(node, Interest::READABLE) }
        .map_err(|e| e.into_parts())?;
    Ok(tokio::spawn(watch_node(node, devnode, stopper)))
}

/// Discard device reports until the node hangs up or fails, then stop
async fn watch_node<T>(node: AsyncFd<T>, devnode: PathBuf, stopper: StopNotifier)
where
    T: AsRawFd,
    for<'a> &'a T: Read,
{
    let mut buf = [0u8; 256];
    loop {
        let mut guard = match node.readable().await {
            Ok(guard) => guard,
            Err(e) => {
                warn!(devnode = %devnode.display(), error = %e, "Cannot poll device node");
                break;
            }
        };
        match guard.try_io(|inner| inner.get_ref().read(&mut buf)) {
            Ok(Ok(0)) => {
                debug!(devnode = %devnode.display(), "Device node hung up");
                break;
            }
            Ok(Ok(n)) => trace!(devnode = %devnode.display(), bytes = n, "Discarding device report"),
            Ok(Err(e)) if e.kind() == ErrorKind::Interrupted => {}
            Ok(Err(e)) => {
                debug!(devnode = %devnode.display(), error = %e, "Device node read failed");
                break;
            }
            Err(_would_block) => {}
        }
    }
    stopper.notify();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::NamedTempFile;
    use tokio::time::timeout;

    fn opener() -> NodeOpener {
        NodeOpener::new(DeviceConfig { read_only: true })
    }

    fn stopper() -> StopNotifier {
        StopNotifier::detached("/devices/test").0
    }

    #[tokio::test]
    async fn test_open_char_device() {
        let dev = Description::builder("/devices/virtual/mem/null")
            .subsystem("mem")
            .devnode("/dev/null")
            .build();
        let handle = opener().open(&dev, stopper()).unwrap();
        assert_eq!(handle.devnode, Path::new("/dev/null"));
    }

    #[test]
    fn test_open_outside_event_loop_fails() {
        let dev = Description::builder("/devices/virtual/mem/null")
            .devnode("/dev/null")
            .build();
        let err = opener().open(&dev, stopper()).unwrap_err();
        assert!(matches!(err, OpenError::Failed(_)));
        assert!(!err.is_incompatible());
    }

    #[test]
    fn test_regular_file_is_incompatible() {
        let file = NamedTempFile::new().unwrap();
        let dev = Description::builder("/devices/fake")
            .devnode(file.path())
            .build();
        let err = opener().open(&dev, stopper()).unwrap_err();
        assert!(err.is_incompatible());
    }

    #[test]
    fn test_missing_node() {
        let dev = Description::builder("/devices/virtual/net/lo").build();
        let err = opener().open(&dev, stopper()).unwrap_err();
        assert!(matches!(err, OpenError::MissingNode(_)));
        assert!(err.is_incompatible());
    }

    #[test]
    fn test_vanished_node_is_an_error() {
        let dev = Description::builder("/devices/usb1")
            .devnode("/dev/devwatch-does-not-exist")
            .build();
        let err = opener().open(&dev, stopper()).unwrap_err();
        assert!(matches!(err, OpenError::Io(_)));
        assert!(!err.is_incompatible());
    }

    #[tokio::test]
    async fn test_hangup_stops_manager() {
        let (node, device) = UnixStream::pair().unwrap();
        node.set_nonblocking(true).unwrap();
        let (stopper, mut stopped) = StopNotifier::detached("/devices/usb1");
        let task = spawn_watch(node, PathBuf::from("/dev/hidraw0"), stopper).unwrap();

        // Reports are drained without stopping
        (&device).write_all(b"report").unwrap();
        assert!(timeout(Duration::from_millis(50), stopped.recv()).await.is_err());

        drop(device);
        let report = timeout(Duration::from_secs(1), stopped.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.devpath(), "/devices/usb1");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_handle_never_stops() {
        let (node, device) = UnixStream::pair().unwrap();
        node.set_nonblocking(true).unwrap();
        let (stopper, mut stopped) = StopNotifier::detached("/devices/usb1");
        let task = spawn_watch(node, PathBuf::from("/dev/hidraw0"), stopper).unwrap();
        let handle = NodeHandle {
            devnode: PathBuf::from("/dev/hidraw0"),
            state: NodeState::Watched(task),
        };

        drop(handle);
        drop(device);
        assert!(stopped.recv().await.is_none());
    }
}
