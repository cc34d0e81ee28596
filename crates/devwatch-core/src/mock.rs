//! In-memory device subsystem
//!
//! `MockSubsystem` keeps a device tree in memory and implements every backend
//! trait. Monitor sessions are backed by a real socket pair, so the watcher's
//! event-loop registration works exactly as with a kernel socket: each queued
//! event writes one byte, making the session readable.

use std::collections::{BTreeMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::description::Description;
use crate::error::WatchError;
use crate::subsystem::{
    DeviceAction, DeviceTree, EnumerationScope, MonitorEvent, MonitorScope, MonitorSession,
    NativeDevice, Subsystem,
};

/// Static record of one device in the mock tree
#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    devpath: String,
    subsystem: Option<String>,
    devtype: Option<String>,
    devnode: Option<PathBuf>,
    driver: Option<String>,
    properties: BTreeMap<String, String>,
    tags: Vec<String>,
    attributes: BTreeMap<String, String>,
}

impl MockDevice {
    pub fn new(devpath: impl Into<String>) -> Self {
        Self {
            devpath: devpath.into(),
            ..Default::default()
        }
    }

    pub fn subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.subsystem = Some(subsystem.into());
        self
    }

    pub fn devtype(mut self, devtype: impl Into<String>) -> Self {
        self.devtype = Some(devtype.into());
        self
    }

    pub fn devnode(mut self, devnode: impl Into<PathBuf>) -> Self {
        self.devnode = Some(devnode.into());
        self
    }

    pub fn driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = Some(driver.into());
        self
    }

    pub fn property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn devpath(&self) -> &str {
        &self.devpath
    }

    fn matches(&self, scope: &EnumerationScope) -> bool {
        let subsystem_ok = scope
            .subsystem
            .as_deref()
            .map_or(true, |s| self.subsystem.as_deref() == Some(s));
        let devtype_ok = scope
            .devtype
            .as_deref()
            .map_or(true, |t| self.devtype.as_deref() == Some(t));
        let properties_ok = scope
            .properties
            .iter()
            .all(|(k, v)| self.properties.get(k) == Some(v));
        let tags_ok = scope.tags.iter().all(|t| self.tags.contains(t));
        subsystem_ok && devtype_ok && properties_ok && tags_ok
    }

    fn to_description(&self, seqnum: u64, tree: Arc<dyn DeviceTree>) -> Description {
        let mut builder = Description::builder(self.devpath.clone())
            .seqnum(seqnum)
            .tree(tree);
        if let Some(subsystem) = &self.subsystem {
            builder = builder.subsystem(subsystem.clone());
        }
        if let Some(devtype) = &self.devtype {
            builder = builder.devtype(devtype.clone());
        }
        if let Some(devnode) = &self.devnode {
            builder = builder.devnode(devnode.clone());
        }
        if let Some(driver) = &self.driver {
            builder = builder.driver(driver.clone());
        }
        for (k, v) in &self.properties {
            builder = builder.property(k.clone(), v.clone());
        }
        for tag in &self.tags {
            builder = builder.tag(tag.clone());
        }
        for (k, v) in &self.attributes {
            builder = builder.attribute(k.clone(), v.clone());
        }
        builder.build()
    }
}

struct MonitorFeed {
    scope: MonitorScope,
    queue: Arc<Mutex<VecDeque<MonitorEvent>>>,
    wake: UnixStream,
}

#[derive(Default)]
struct MockState {
    devices: BTreeMap<String, MockDevice>,
    feeds: Vec<MonitorFeed>,
    seqnum: u64,
    describe_calls: usize,
    fail_enumeration: bool,
    fail_monitor: bool,
    fail_reads: bool,
    last_enumeration_scope: Option<EnumerationScope>,
    last_monitor_scope: Option<MonitorScope>,
}

impl MockState {
    fn prune_feeds(&mut self) {
        self.feeds.retain(|feed| Arc::strong_count(&feed.queue) > 1);
    }
}

/// Device tree view handed to descriptions
struct MockTree {
    state: Arc<Mutex<MockState>>,
}

impl MockTree {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn devpath_of(syspath: &Path) -> String {
    let devpath = syspath.strip_prefix("/sys").unwrap_or(syspath);
    format!("/{}", devpath.display()).replace("//", "/")
}

impl DeviceTree for MockTree {
    fn parent(&self, syspath: &Path) -> Result<Option<Description>, WatchError> {
        let devpath = devpath_of(syspath);
        let state = self.lock();
        let mut current = Path::new(&devpath).parent();
        while let Some(path) = current {
            if let Some(device) = path.to_str().and_then(|p| state.devices.get(p)) {
                let tree: Arc<dyn DeviceTree> = Arc::new(MockTree {
                    state: self.state.clone(),
                });
                return Ok(Some(device.to_description(0, tree)));
            }
            current = path.parent();
        }
        Ok(None)
    }

    fn descendants(
        &self,
        syspath: &Path,
        subsystem: &str,
    ) -> Result<Vec<Description>, WatchError> {
        let prefix = format!("{}/", devpath_of(syspath));
        let state = self.lock();
        let tree: Arc<dyn DeviceTree> = Arc::new(MockTree {
            state: self.state.clone(),
        });
        Ok(state
            .devices
            .values()
            .filter(|d| d.devpath.starts_with(&prefix))
            .filter(|d| d.subsystem.as_deref() == Some(subsystem))
            .map(|d| d.to_description(0, tree.clone()))
            .collect())
    }
}

/// Enumerated device handle; describing it is counted
pub struct MockNativeDevice {
    record: MockDevice,
    state: Arc<Mutex<MockState>>,
}

impl NativeDevice for MockNativeDevice {
    fn devpath(&self) -> String {
        self.record.devpath.clone()
    }

    fn describe(&self) -> Description {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .describe_calls += 1;
        let tree: Arc<dyn DeviceTree> = Arc::new(MockTree {
            state: self.state.clone(),
        });
        self.record.to_description(0, tree)
    }
}

/// Monitoring session reading from an in-memory queue
pub struct MockMonitor {
    queue: Arc<Mutex<VecDeque<MonitorEvent>>>,
    socket: UnixStream,
    state: Arc<Mutex<MockState>>,
}

impl AsRawFd for MockMonitor {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

// SAFETY: the socket is owned by the monitor and never replaced
unsafe impl MonitorSession for MockMonitor {
    fn next_event(&mut self) -> Result<Option<MonitorEvent>, WatchError> {
        if self.state.lock().unwrap_or_else(|e| e.into_inner()).fail_reads {
            return Err(WatchError::Monitor("mock read failure".to_string()));
        }

        let event = self
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        // Consume one wake byte per event, everything once the queue is empty
        let mut buf = [0u8; 64];
        let want = if event.is_some() { 1 } else { buf.len() };
        loop {
            match self.socket.read(&mut buf[..want]) {
                Ok(n) if n > 0 && event.is_none() => continue,
                Ok(_) => break,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(WatchError::Io(e)),
            }
        }

        Ok(event)
    }
}

/// In-memory device subsystem
#[derive(Clone, Default)]
pub struct MockSubsystem {
    state: Arc<Mutex<MockState>>,
}

impl MockSubsystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tree(&self) -> Arc<dyn DeviceTree> {
        Arc::new(MockTree {
            state: self.state.clone(),
        })
    }

    /// Add a device without notifying monitors
    pub fn insert(&self, device: MockDevice) {
        self.lock().devices.insert(device.devpath.clone(), device);
    }

    /// Remove a device without notifying monitors
    pub fn remove(&self, devpath: &str) -> bool {
        self.lock().devices.remove(devpath).is_some()
    }

    /// Remove every device without notifying monitors
    pub fn clear(&self) {
        self.lock().devices.clear();
    }

    /// Hot-plug a device: insert it and queue an add event
    pub fn plug(&self, device: MockDevice) {
        let devpath = device.devpath.clone();
        self.insert(device);
        self.emit(DeviceAction::Add, &devpath);
    }

    /// Hot-unplug a device: queue a remove event and forget it
    pub fn unplug(&self, devpath: &str) {
        self.emit(DeviceAction::Remove, devpath);
        self.remove(devpath);
    }

    /// Queue an arbitrary event for a device
    ///
    /// Devices not in the tree are reported with a bare description. It has
    /// no subsystem, so only unscoped monitors receive it.
    pub fn emit(&self, action: DeviceAction, devpath: &str) {
        let tree = self.tree();
        let mut state = self.lock();
        state.prune_feeds();
        state.seqnum += 1;
        let seqnum = state.seqnum;
        let device = match state.devices.get(devpath) {
            Some(record) => record.to_description(seqnum, tree),
            None => Description::builder(devpath).seqnum(seqnum).build(),
        };

        for feed in &mut state.feeds {
            if !feed.scope.matches(&device) {
                continue;
            }
            feed.queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_back(MonitorEvent {
                    action,
                    device: device.clone(),
                });
            let _ = feed.wake.write(&[1]);
        }
    }

    /// Snapshot a device currently in the tree
    pub fn describe(&self, devpath: &str) -> Option<Description> {
        let tree = self.tree();
        self.lock()
            .devices
            .get(devpath)
            .map(|record| record.to_description(0, tree))
    }

    pub fn set_fail_enumeration(&self, fail: bool) {
        self.lock().fail_enumeration = fail;
    }

    pub fn set_fail_monitor(&self, fail: bool) {
        self.lock().fail_monitor = fail;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    /// Number of times an enumerated device was described
    pub fn describe_calls(&self) -> usize {
        self.lock().describe_calls
    }

    /// Number of monitoring sessions still open
    pub fn open_monitors(&self) -> usize {
        let mut state = self.lock();
        state.prune_feeds();
        state.feeds.len()
    }

    pub fn last_enumeration_scope(&self) -> Option<EnumerationScope> {
        self.lock().last_enumeration_scope.clone()
    }

    pub fn last_monitor_scope(&self) -> Option<MonitorScope> {
        self.lock().last_monitor_scope.clone()
    }
}

impl Subsystem for MockSubsystem {
    type Device = MockNativeDevice;
    type Monitor = MockMonitor;

    fn enumerate(&self, scope: &EnumerationScope) -> Result<Vec<Self::Device>, WatchError> {
        let mut state = self.lock();
        state.last_enumeration_scope = Some(scope.clone());
        if state.fail_enumeration {
            return Err(WatchError::Enumeration("mock enumeration failure".to_string()));
        }
        Ok(state
            .devices
            .values()
            .filter(|d| d.matches(scope))
            .map(|d| MockNativeDevice {
                record: d.clone(),
                state: self.state.clone(),
            })
            .collect())
    }

    fn open_monitor(&self, scope: &MonitorScope) -> Result<Self::Monitor, WatchError> {
        let mut state = self.lock();
        state.last_monitor_scope = Some(scope.clone());
        if state.fail_monitor {
            return Err(WatchError::Connection("mock monitor unavailable".to_string()));
        }

        let (wake, socket) = UnixStream::pair()?;
        wake.set_nonblocking(true)?;
        socket.set_nonblocking(true)?;
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        state.feeds.push(MonitorFeed {
            scope: scope.clone(),
            queue: queue.clone(),
            wake,
        });

        Ok(MockMonitor {
            queue,
            socket,
            state: self.state.clone(),
        })
    }
}
