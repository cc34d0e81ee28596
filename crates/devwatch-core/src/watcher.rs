//! Device watcher and enumerator
//!
//! The watcher either scans the device subsystem on demand or, when active,
//! follows hot-plug events from a monitoring session registered with the
//! tokio reactor. Every detected addition or removal is run through the
//! watcher's [`DeviceFilter`] and delivered to subscribers.
//!
//! Scanning is incremental: the first scan reports every visible device as
//! added, later scans report only what changed since the previous pass.
//! Dropping the watcher does not report known devices as removed.

use std::collections::{HashMap, HashSet};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::description::Description;
use crate::error::WatchError;
use crate::filter::{AcceptAll, DeviceFilter, MatchRules};
use crate::subsystem::{DeviceAction, MonitorEvent, MonitorSession, NativeDevice, Subsystem};

/// Notification delivered to watcher subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A visible device appeared
    Added(Description),
    /// A previously reported device disappeared
    Removed(Description),
}

impl WatchEvent {
    pub fn description(&self) -> &Description {
        match self {
            Self::Added(dev) | Self::Removed(dev) => dev,
        }
    }

    pub fn devpath(&self) -> &str {
        self.description().devpath()
    }

    pub fn is_added(&self) -> bool {
        matches!(self, Self::Added(_))
    }
}

/// Outcome of a single scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub added: usize,
    pub removed: usize,
    /// Devices known after the scan
    pub known: usize,
}

/// Watcher over a device subsystem `S`, filtered by `F`
pub struct DeviceWatcher<S: Subsystem, F: DeviceFilter = AcceptAll> {
    subsystem: S,
    filter: F,
    /// Last observed devices, keyed by devpath
    known: HashMap<String, Description>,
    /// Monitoring session registered with the reactor, present while active
    monitor: Option<AsyncFd<S::Monitor>>,
    subscribers: Vec<mpsc::UnboundedSender<WatchEvent>>,
}

/// Watcher restricted to devices matching a fixed rule set
pub type FilteredDeviceWatcher<S> = DeviceWatcher<S, MatchRules>;

impl<S: Subsystem> DeviceWatcher<S, AcceptAll> {
    /// Create a watcher reporting every device
    pub fn new(subsystem: S) -> Self {
        Self::with_filter(subsystem, AcceptAll)
    }
}

impl<S: Subsystem, F: DeviceFilter> DeviceWatcher<S, F> {
    /// Create an inactive watcher using `filter`
    pub fn with_filter(subsystem: S, filter: F) -> Self {
        Self {
            subsystem,
            filter,
            known: HashMap::new(),
            monitor: None,
            subscribers: Vec::new(),
        }
    }

    /// Subscribe to added/removed events
    ///
    /// Events are queued synchronously by [`scan`](Self::scan) and
    /// [`process_monitor`](Self::process_monitor) before they return.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<WatchEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }

    /// Mutable access to the filter
    ///
    /// The filter must only be changed while the watcher is inactive, the
    /// monitoring subscription keeps the scope it was opened with.
    pub fn filter_mut(&mut self) -> &mut F {
        if self.is_active() {
            warn!("Device filter modified while watcher is active");
        }
        &mut self.filter
    }

    pub fn subsystem(&self) -> &S {
        &self.subsystem
    }

    /// Whether the watcher is following hot-plug events
    pub fn is_active(&self) -> bool {
        self.monitor.is_some()
    }

    /// Currently known devices, in no particular order
    pub fn known(&self) -> impl Iterator<Item = &Description> {
        self.known.values()
    }

    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    pub fn get(&self, devpath: &str) -> Option<&Description> {
        self.known.get(devpath)
    }

    pub fn is_visible(&self, dev: &Description) -> bool {
        self.filter.is_visible(dev)
    }

    /// Run one enumeration pass and report the difference with the last one
    ///
    /// If enumeration fails, nothing is changed and no event is emitted.
    pub fn scan(&mut self) -> Result<ScanReport, WatchError> {
        let scope = self.filter.enumeration_scope();
        let devices = self.subsystem.enumerate(&scope)?;
        debug!(count = devices.len(), "Enumerated devices");

        let mut seen: HashSet<String> = HashSet::with_capacity(devices.len());
        let mut added = Vec::new();
        for device in &devices {
            let devpath = device.devpath();
            if self.known.contains_key(&devpath) || seen.contains(&devpath) {
                seen.insert(devpath);
                continue;
            }
            let description = device.describe();
            if self.filter.is_visible(&description) {
                added.push(description);
            } else {
                trace!(devpath = %devpath, "Device filtered out");
            }
            seen.insert(devpath);
        }

        let gone: Vec<String> = self
            .known
            .keys()
            .filter(|devpath| !seen.contains(*devpath))
            .cloned()
            .collect();

        let mut report = ScanReport {
            added: added.len(),
            removed: gone.len(),
            known: 0,
        };

        for description in added {
            debug!(devpath = %description.devpath(), "Device added");
            self.known
                .insert(description.devpath().to_string(), description.clone());
            self.emit(WatchEvent::Added(description));
        }
        for devpath in gone {
            if let Some(description) = self.known.remove(&devpath) {
                debug!(devpath = %devpath, "Device removed");
                self.emit(WatchEvent::Removed(description));
            }
        }

        report.known = self.known.len();
        info!(
            added = report.added,
            removed = report.removed,
            known = report.known,
            "Scan complete"
        );
        Ok(report)
    }

    /// Start or stop following hot-plug events
    ///
    /// Activation opens a monitoring session and registers it with the
    /// current tokio runtime; it must be called from within one. Deactivation
    /// closes the session without scanning again. Setting the current state
    /// again does nothing.
    pub fn set_active(&mut self, active: bool) -> Result<(), WatchError> {
        if active == self.is_active() {
            return Ok(());
        }

        if !active {
            self.monitor = None;
            info!("Device monitoring stopped");
            return Ok(());
        }

        if tokio::runtime::Handle::try_current().is_err() {
            return Err(WatchError::Connection(
                "device monitoring requires a running event loop".to_string(),
            ));
        }

        let scope = self.filter.monitor_scope();
        let session = self.subsystem.open_monitor(&scope)?;
        // SAFETY: the session is owned by the AsyncFd, and MonitorSession
        // guarantees its descriptor stays open and unchanged while it lives
        let registered = unsafe { AsyncFd::register_with_interest(session, Interest::READABLE) }
            .map_err(|e| {
                WatchError::Connection(format!("cannot register monitor with event loop: {e}"))
            })?;
        self.monitor = Some(registered);

        info!(
            subsystem = scope.subsystem.as_deref().unwrap_or("*"),
            devtype = scope.devtype.as_deref().unwrap_or("*"),
            "Device monitoring started"
        );
        Ok(())
    }

    /// Wait for hot-plug activity and apply every pending event
    ///
    /// Returns the number of events emitted. While the watcher is inactive
    /// this never completes, so it can sit in a `select!` unconditionally.
    /// A read error aborts the tick before anything is applied.
    pub async fn process_monitor(&mut self) -> Result<usize, WatchError> {
        let events = match self.monitor.as_mut() {
            Some(monitor) => drain_monitor(monitor).await?,
            None => std::future::pending().await,
        };

        trace!(count = events.len(), "Monitor events drained");
        let mut emitted = 0;
        for event in events {
            if self.apply_event(event) {
                emitted += 1;
            }
        }
        Ok(emitted)
    }

    fn apply_event(&mut self, event: MonitorEvent) -> bool {
        let MonitorEvent { action, device } = event;
        match action {
            DeviceAction::Add => {
                if self.known.contains_key(device.devpath()) {
                    trace!(devpath = %device.devpath(), "Add event for known device");
                    return false;
                }
                if !self.filter.is_visible(&device) {
                    trace!(devpath = %device.devpath(), "Device filtered out");
                    return false;
                }
                debug!(devpath = %device.devpath(), seqnum = device.seqnum(), "Device added");
                self.known
                    .insert(device.devpath().to_string(), device.clone());
                self.emit(WatchEvent::Added(device));
                true
            }
            // Removals bypass the filter so stale entries are always cleared
            DeviceAction::Remove => match self.known.remove(device.devpath()) {
                Some(stored) => {
                    debug!(devpath = %device.devpath(), seqnum = device.seqnum(), "Device removed");
                    self.emit(WatchEvent::Removed(stored));
                    true
                }
                None => {
                    debug!(
                        devpath = %device.devpath(),
                        seqnum = device.seqnum(),
                        "Remove event for unknown device, its addition may have been missed"
                    );
                    false
                }
            },
            other => {
                trace!(action = %other, devpath = %device.devpath(), "Ignoring monitor event");
                false
            }
        }
    }

    fn emit(&mut self, event: WatchEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl<S: Subsystem, F: DeviceFilter> Drop for DeviceWatcher<S, F> {
    fn drop(&mut self) {
        if self.monitor.take().is_some() {
            debug!(known = self.known.len(), "Watcher dropped while active");
        }
    }
}

/// Wait until the session is readable, then read everything pending
async fn drain_monitor<M: MonitorSession>(
    monitor: &mut AsyncFd<M>,
) -> Result<Vec<MonitorEvent>, WatchError> {
    loop {
        let mut guard = monitor.readable_mut().await?;
        let mut events = Vec::new();
        while let Some(event) = guard.get_inner_mut().next_event()? {
            events.push(event);
        }
        guard.clear_ready();
        if !events.is_empty() {
            return Ok(events);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockSubsystem};
    use std::time::Duration;
    use tokio::time::timeout;

    fn hidraw(n: u32) -> MockDevice {
        MockDevice::new(format!("/devices/usb1/1-{n}/1-{n}:1.0/hidraw/hidraw{n}"))
            .subsystem("hidraw")
            .devnode(format!("/dev/hidraw{n}"))
            .property("ID_BUS", "usb")
    }

    fn keyboard(n: u32) -> MockDevice {
        MockDevice::new(format!("/devices/usb1/1-{n}/1-{n}:1.0/input/input{n}/event{n}"))
            .subsystem("input")
            .property("ID_INPUT_KEYBOARD", "1")
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WatchEvent>) -> Vec<WatchEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn sorted_devpaths(events: &[WatchEvent]) -> Vec<String> {
        let mut paths: Vec<String> = events.iter().map(|e| e.devpath().to_string()).collect();
        paths.sort();
        paths
    }

    fn input_rules() -> MatchRules {
        let mut rules = MatchRules::new();
        rules.set_subsystem("input");
        rules.add_property("ID_INPUT_KEYBOARD", "1");
        rules
    }

    #[test]
    fn test_first_scan_adds_every_device() {
        let mock = MockSubsystem::new();
        mock.insert(hidraw(0));
        mock.insert(hidraw(1));
        mock.insert(keyboard(2));

        let mut watcher = DeviceWatcher::new(mock.clone());
        let mut rx = watcher.subscribe();
        let report = watcher.scan().unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(WatchEvent::is_added));
        assert_eq!(
            report,
            ScanReport {
                added: 3,
                removed: 0,
                known: 3
            }
        );
    }

    #[test]
    fn test_identical_rescan_is_silent() {
        let mock = MockSubsystem::new();
        mock.insert(hidraw(0));
        mock.insert(hidraw(1));

        let mut watcher = DeviceWatcher::new(mock.clone());
        let mut rx = watcher.subscribe();
        watcher.scan().unwrap();
        drain(&mut rx);
        let described = mock.describe_calls();

        let report = watcher.scan().unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(report.added + report.removed, 0);
        // Known devices are not described again
        assert_eq!(mock.describe_calls(), described);
    }

    #[test]
    fn test_rescan_reports_difference() {
        let mock = MockSubsystem::new();
        mock.insert(hidraw(0));
        mock.insert(hidraw(1));

        let mut watcher = DeviceWatcher::new(mock.clone());
        let mut rx = watcher.subscribe();
        watcher.scan().unwrap();
        drain(&mut rx);

        mock.remove(hidraw(0).devpath());
        mock.insert(hidraw(2));
        watcher.scan().unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        let added: Vec<_> = events.iter().filter(|e| e.is_added()).collect();
        let removed: Vec<_> = events.iter().filter(|e| !e.is_added()).collect();
        assert_eq!(added[0].devpath(), hidraw(2).devpath());
        assert_eq!(removed[0].devpath(), hidraw(0).devpath());
        assert_eq!(
            removed[0].description().devnode(),
            Some(std::path::Path::new("/dev/hidraw0"))
        );
    }

    #[test]
    fn test_removing_everything_removes_each_once() {
        let mock = MockSubsystem::new();
        mock.insert(keyboard(0));
        mock.insert(keyboard(1));
        mock.insert(hidraw(2));

        let mut watcher = DeviceWatcher::with_filter(mock.clone(), input_rules());
        let mut rx = watcher.subscribe();
        watcher.scan().unwrap();
        assert_eq!(drain(&mut rx).len(), 2);

        mock.clear();
        watcher.scan().unwrap();
        let events = drain(&mut rx);
        assert!(events.iter().all(|e| !e.is_added()));
        assert_eq!(
            sorted_devpaths(&events),
            vec![keyboard(0).devpath().to_string(), keyboard(1).devpath().to_string()]
        );
        assert_eq!(watcher.known_count(), 0);
    }

    #[test]
    fn test_known_tracks_visible_enumeration() {
        let mock = MockSubsystem::new();
        let mut watcher = DeviceWatcher::with_filter(mock.clone(), input_rules());

        let steps: Vec<Vec<MockDevice>> = vec![
            vec![keyboard(0), hidraw(1)],
            vec![keyboard(0), keyboard(2), hidraw(1)],
            vec![keyboard(2)],
            vec![],
            vec![keyboard(3), keyboard(0)],
        ];

        for devices in steps {
            mock.clear();
            let mut expected: Vec<String> = devices
                .iter()
                .filter(|d| d.devpath().contains("/input/"))
                .map(|d| d.devpath().to_string())
                .collect();
            for device in devices {
                mock.insert(device);
            }

            watcher.scan().unwrap();
            let mut known: Vec<String> =
                watcher.known().map(|d| d.devpath().to_string()).collect();
            known.sort();
            expected.sort();
            assert_eq!(known, expected);
        }
    }

    #[test]
    fn test_filtered_watcher_rejects_missing_property() {
        let mock = MockSubsystem::new();
        mock.insert(keyboard(0));
        mock.insert(
            MockDevice::new("/devices/platform/pcspkr/input/input5/event5").subsystem("input"),
        );

        let mut watcher: FilteredDeviceWatcher<_> =
            DeviceWatcher::with_filter(mock.clone(), input_rules());
        let mut rx = watcher.subscribe();
        watcher.scan().unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].devpath(), keyboard(0).devpath());
        assert!(watcher.get("/devices/platform/pcspkr/input/input5/event5").is_none());
    }

    #[test]
    fn test_scan_passes_enumeration_scope() {
        let mock = MockSubsystem::new();
        let mut watcher = DeviceWatcher::with_filter(mock.clone(), input_rules());
        watcher.scan().unwrap();

        let scope = mock.last_enumeration_scope().unwrap();
        assert_eq!(scope.subsystem.as_deref(), Some("input"));
        assert_eq!(
            scope.properties.get("ID_INPUT_KEYBOARD").map(String::as_str),
            Some("1")
        );
    }

    #[test]
    fn test_failed_enumeration_changes_nothing() {
        let mock = MockSubsystem::new();
        mock.insert(hidraw(0));
        let mut watcher = DeviceWatcher::new(mock.clone());
        let mut rx = watcher.subscribe();
        watcher.scan().unwrap();
        drain(&mut rx);

        mock.clear();
        mock.set_fail_enumeration(true);
        assert!(matches!(watcher.scan(), Err(WatchError::Enumeration(_))));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(watcher.known_count(), 1);
    }

    #[test]
    fn test_drop_emits_no_removals() {
        let mock = MockSubsystem::new();
        mock.insert(hidraw(0));
        mock.insert(hidraw(1));

        let mut watcher = DeviceWatcher::new(mock.clone());
        let mut rx = watcher.subscribe();
        watcher.scan().unwrap();
        drain(&mut rx);

        drop(watcher);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_activation_needs_event_loop() {
        let mut watcher = DeviceWatcher::new(MockSubsystem::new());
        assert!(matches!(
            watcher.set_active(true),
            Err(WatchError::Connection(_))
        ));
        assert!(!watcher.is_active());
    }

    #[tokio::test]
    async fn test_drop_active_watcher_closes_monitor() {
        let mock = MockSubsystem::new();
        mock.insert(hidraw(0));

        let mut watcher = DeviceWatcher::new(mock.clone());
        let mut rx = watcher.subscribe();
        watcher.scan().unwrap();
        watcher.set_active(true).unwrap();
        drain(&mut rx);
        assert_eq!(mock.open_monitors(), 1);

        drop(watcher);
        assert_eq!(mock.open_monitors(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_set_active_toggles_session() {
        let mock = MockSubsystem::new();
        let mut watcher = DeviceWatcher::with_filter(mock.clone(), input_rules());

        watcher.set_active(true).unwrap();
        watcher.set_active(true).unwrap();
        assert!(watcher.is_active());
        assert_eq!(mock.open_monitors(), 1);

        let scope = mock.last_monitor_scope().unwrap();
        assert_eq!(scope.subsystem.as_deref(), Some("input"));

        watcher.set_active(false).unwrap();
        assert!(!watcher.is_active());
        assert_eq!(mock.open_monitors(), 0);
        watcher.set_active(false).unwrap();
    }

    #[tokio::test]
    async fn test_failed_activation_is_reported() {
        let mock = MockSubsystem::new();
        mock.set_fail_monitor(true);
        let mut watcher = DeviceWatcher::new(mock.clone());
        let mut rx = watcher.subscribe();

        assert!(matches!(
            watcher.set_active(true),
            Err(WatchError::Connection(_))
        ));
        assert!(!watcher.is_active());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_monitor_add_and_remove() {
        let mock = MockSubsystem::new();
        let mut watcher = DeviceWatcher::new(mock.clone());
        let mut rx = watcher.subscribe();
        watcher.set_active(true).unwrap();

        mock.plug(hidraw(0));
        let emitted = timeout(Duration::from_secs(1), watcher.process_monitor())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(emitted, 1);
        let events = drain(&mut rx);
        assert!(events[0].is_added());
        assert!(events[0].description().seqnum() > 0);

        mock.unplug(hidraw(0).devpath());
        timeout(Duration::from_secs(1), watcher.process_monitor())
            .await
            .unwrap()
            .unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(!events[0].is_added());
        assert_eq!(watcher.known_count(), 0);
    }

    #[tokio::test]
    async fn test_monitor_drains_burst_in_one_tick() {
        let mock = MockSubsystem::new();
        let mut watcher = DeviceWatcher::new(mock.clone());
        let mut rx = watcher.subscribe();
        watcher.set_active(true).unwrap();

        for n in 0..5 {
            mock.plug(hidraw(n));
        }
        let emitted = timeout(Duration::from_secs(1), watcher.process_monitor())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(emitted, 5);
        assert_eq!(drain(&mut rx).len(), 5);
    }

    #[tokio::test]
    async fn test_monitor_checks_visibility_on_add_only() {
        let mock = MockSubsystem::new();
        mock.insert(keyboard(0));
        let mut watcher = DeviceWatcher::with_filter(mock.clone(), input_rules());
        let mut rx = watcher.subscribe();
        watcher.scan().unwrap();
        watcher.set_active(true).unwrap();
        drain(&mut rx);

        // Same subsystem, so it passes the subscription, but lacks the property
        mock.plug(MockDevice::new("/devices/platform/pcspkr/input/input5/event5").subsystem("input"));
        // The remove event no longer carries the udev properties the filter needs
        mock.insert(MockDevice::new(keyboard(0).devpath()).subsystem("input"));
        mock.emit(DeviceAction::Remove, keyboard(0).devpath());

        let emitted = timeout(Duration::from_secs(1), watcher.process_monitor())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(emitted, 1);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(!events[0].is_added());
        assert_eq!(events[0].devpath(), keyboard(0).devpath());
        // The stored snapshot is reported, not the stripped one from the event
        assert_eq!(events[0].description().property("ID_INPUT_KEYBOARD"), Some("1"));
        assert_eq!(watcher.known_count(), 0);
    }

    #[tokio::test]
    async fn test_scoped_monitor_skips_events_outside_subsystem() {
        let mock = MockSubsystem::new();
        let mut watcher = DeviceWatcher::with_filter(mock.clone(), input_rules());
        watcher.set_active(true).unwrap();

        mock.emit(DeviceAction::Remove, "/devices/usb1/1-9/1-9:1.0/input/input9/event9");
        mock.plug(hidraw(0));

        let tick = timeout(Duration::from_millis(50), watcher.process_monitor()).await;
        assert!(tick.is_err());
    }

    #[tokio::test]
    async fn test_monitor_ignores_duplicates_and_unknown_removals() {
        let mock = MockSubsystem::new();
        mock.insert(hidraw(0));
        let mut watcher = DeviceWatcher::new(mock.clone());
        let mut rx = watcher.subscribe();
        watcher.scan().unwrap();
        watcher.set_active(true).unwrap();
        drain(&mut rx);

        mock.emit(DeviceAction::Add, hidraw(0).devpath());
        mock.emit(DeviceAction::Remove, "/devices/usb1/1-9/1-9:1.0/hidraw/hidraw9");
        mock.emit(DeviceAction::Change, hidraw(0).devpath());

        let emitted = timeout(Duration::from_secs(1), watcher.process_monitor())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(emitted, 0);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(watcher.known_count(), 1);
    }

    #[tokio::test]
    async fn test_monitor_read_error_changes_nothing() {
        let mock = MockSubsystem::new();
        let mut watcher = DeviceWatcher::new(mock.clone());
        let mut rx = watcher.subscribe();
        watcher.set_active(true).unwrap();

        mock.plug(hidraw(0));
        mock.set_fail_reads(true);
        let result = timeout(Duration::from_secs(1), watcher.process_monitor())
            .await
            .unwrap();
        assert!(matches!(result, Err(WatchError::Monitor(_))));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(watcher.known_count(), 0);
    }

    #[tokio::test]
    async fn test_inactive_watcher_never_ticks() {
        let mut watcher = DeviceWatcher::new(MockSubsystem::new());
        let result = timeout(Duration::from_millis(50), watcher.process_monitor()).await;
        assert!(result.is_err());
    }
}
