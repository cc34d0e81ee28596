//! Device description snapshots
//!
//! A [`Description`] captures everything known about one device at the time it
//! was observed: identity, state, properties, tags and attributes. All
//! collections are read once at construction, cloning a description never
//! queries the device subsystem again.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::WatchError;
use crate::subsystem::DeviceTree;

pub type PropertyMap = BTreeMap<String, String>;
pub type TagList = Vec<String>;
pub type AttributeMap = BTreeMap<String, String>;

/// Immutable snapshot of a single device
#[derive(Clone, Serialize)]
pub struct Description {
    devpath: String,
    subsystem: Option<String>,
    devtype: Option<String>,
    syspath: PathBuf,
    sysname: String,
    sysnum: Option<String>,
    devnode: Option<PathBuf>,
    driver: Option<String>,
    initialized: bool,
    seqnum: u64,
    usec_since_initialized: u64,
    properties: PropertyMap,
    tags: TagList,
    attributes: AttributeMap,
    /// Backend handle used for parent/descendant queries
    #[serde(skip)]
    tree: Option<Arc<dyn DeviceTree>>,
}

impl Description {
    /// Start building a description for the device at `devpath`
    pub fn builder(devpath: impl Into<String>) -> DescriptionBuilder {
        DescriptionBuilder::new(devpath)
    }

    /// Kernel device path, the unique identity key of a device
    pub fn devpath(&self) -> &str {
        &self.devpath
    }

    pub fn subsystem(&self) -> Option<&str> {
        self.subsystem.as_deref()
    }

    pub fn devtype(&self) -> Option<&str> {
        self.devtype.as_deref()
    }

    pub fn syspath(&self) -> &Path {
        &self.syspath
    }

    pub fn sysname(&self) -> &str {
        &self.sysname
    }

    pub fn sysnum(&self) -> Option<&str> {
        self.sysnum.as_deref()
    }

    /// Device node under /dev, if the device has one
    pub fn devnode(&self) -> Option<&Path> {
        self.devnode.as_deref()
    }

    pub fn driver(&self) -> Option<&str> {
        self.driver.as_deref()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Event sequence number, zero for enumerated devices
    pub fn seqnum(&self) -> u64 {
        self.seqnum
    }

    /// Microseconds between device initialization and this snapshot
    pub fn usec_since_initialized(&self) -> u64 {
        self.usec_since_initialized
    }

    pub fn properties(&self) -> &PropertyMap {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(|s| s.as_str())
    }

    pub fn tags(&self) -> &TagList {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn attributes(&self) -> &AttributeMap {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(|s| s.as_str())
    }

    /// Immediate parent in the device tree
    pub fn parent(&self) -> Result<Description, WatchError> {
        let tree = self.tree()?;
        tree.parent(&self.syspath)?
            .ok_or_else(|| WatchError::NotFound(format!("{} has no parent", self.devpath)))
    }

    /// Closest ancestor in `subsystem`, optionally also matching `devtype`
    pub fn parent_with_type(
        &self,
        subsystem: &str,
        devtype: Option<&str>,
    ) -> Result<Description, WatchError> {
        let devtype = devtype.filter(|t| !t.is_empty());
        let not_found = || {
            WatchError::NotFound(format!(
                "{} has no ancestor of type {}/{}",
                self.devpath,
                subsystem,
                devtype.unwrap_or("*")
            ))
        };

        let mut current = match self.parent() {
            Ok(parent) => parent,
            Err(e) if e.is_not_found() => return Err(not_found()),
            Err(e) => return Err(e),
        };
        loop {
            let subsystem_ok = current.subsystem() == Some(subsystem);
            let devtype_ok = devtype.map_or(true, |t| current.devtype() == Some(t));
            if subsystem_ok && devtype_ok {
                return Ok(current);
            }
            current = match current.parent() {
                Ok(parent) => parent,
                Err(e) if e.is_not_found() => return Err(not_found()),
                Err(e) => return Err(e),
            };
        }
    }

    /// All descendants in `subsystem`, regardless of depth
    ///
    /// An empty result is not an error.
    pub fn descendants_with_type(&self, subsystem: &str) -> Result<Vec<Description>, WatchError> {
        match &self.tree {
            Some(tree) => tree.descendants(&self.syspath, subsystem),
            None => Ok(Vec::new()),
        }
    }

    fn tree(&self) -> Result<&Arc<dyn DeviceTree>, WatchError> {
        self.tree.as_ref().ok_or_else(|| {
            WatchError::NotFound(format!("{} is detached from the device tree", self.devpath))
        })
    }
}

impl PartialEq for Description {
    fn eq(&self, other: &Self) -> bool {
        self.devpath == other.devpath
            && self.subsystem == other.subsystem
            && self.devtype == other.devtype
            && self.syspath == other.syspath
            && self.sysname == other.sysname
            && self.sysnum == other.sysnum
            && self.devnode == other.devnode
            && self.driver == other.driver
            && self.initialized == other.initialized
            && self.seqnum == other.seqnum
            && self.usec_since_initialized == other.usec_since_initialized
            && self.properties == other.properties
            && self.tags == other.tags
            && self.attributes == other.attributes
    }
}

impl Eq for Description {}

impl std::fmt::Debug for Description {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Description")
            .field("devpath", &self.devpath)
            .field("subsystem", &self.subsystem)
            .field("devtype", &self.devtype)
            .field("devnode", &self.devnode)
            .field("driver", &self.driver)
            .field("properties", &self.properties.len())
            .field("tags", &self.tags)
            .field("attributes", &self.attributes.len())
            .finish()
    }
}

impl std::fmt::Display for Description {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.devnode {
            Some(node) => write!(f, "{} ({})", self.devpath, node.display()),
            None => write!(f, "{}", self.devpath),
        }
    }
}

/// Builder used by backends (and tests) to construct descriptions
pub struct DescriptionBuilder {
    inner: Description,
    syspath_set: bool,
    sysname_set: bool,
}

impl DescriptionBuilder {
    fn new(devpath: impl Into<String>) -> Self {
        let devpath = devpath.into();
        Self {
            inner: Description {
                devpath,
                subsystem: None,
                devtype: None,
                syspath: PathBuf::new(),
                sysname: String::new(),
                sysnum: None,
                devnode: None,
                driver: None,
                initialized: true,
                seqnum: 0,
                usec_since_initialized: 0,
                properties: PropertyMap::new(),
                tags: TagList::new(),
                attributes: AttributeMap::new(),
                tree: None,
            },
            syspath_set: false,
            sysname_set: false,
        }
    }

    pub fn subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.inner.subsystem = Some(subsystem.into());
        self
    }

    pub fn devtype(mut self, devtype: impl Into<String>) -> Self {
        self.inner.devtype = Some(devtype.into());
        self
    }

    pub fn syspath(mut self, syspath: impl Into<PathBuf>) -> Self {
        self.inner.syspath = syspath.into();
        self.syspath_set = true;
        self
    }

    pub fn sysname(mut self, sysname: impl Into<String>) -> Self {
        self.inner.sysname = sysname.into();
        self.sysname_set = true;
        self
    }

    pub fn sysnum(mut self, sysnum: impl Into<String>) -> Self {
        self.inner.sysnum = Some(sysnum.into());
        self
    }

    pub fn devnode(mut self, devnode: impl Into<PathBuf>) -> Self {
        self.inner.devnode = Some(devnode.into());
        self
    }

    pub fn driver(mut self, driver: impl Into<String>) -> Self {
        self.inner.driver = Some(driver.into());
        self
    }

    pub fn initialized(mut self, initialized: bool) -> Self {
        self.inner.initialized = initialized;
        self
    }

    pub fn seqnum(mut self, seqnum: u64) -> Self {
        self.inner.seqnum = seqnum;
        self
    }

    pub fn usec_since_initialized(mut self, usec: u64) -> Self {
        self.inner.usec_since_initialized = usec;
        self
    }

    /// Set a property; a later value for the same name replaces the earlier one
    pub fn property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.properties.insert(name.into(), value.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.inner.tags.push(tag.into());
        self
    }

    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.attributes.insert(name.into(), value.into());
        self
    }

    pub fn tree(mut self, tree: Arc<dyn DeviceTree>) -> Self {
        self.inner.tree = Some(tree);
        self
    }

    pub fn build(self) -> Description {
        let mut inner = self.inner;
        if !self.syspath_set {
            inner.syspath = PathBuf::from(format!("/sys{}", inner.devpath));
        }
        if !self.sysname_set {
            inner.sysname = inner
                .devpath
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string();
        }
        inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockSubsystem};

    fn keyboard_tree() -> MockSubsystem {
        let mock = MockSubsystem::new();
        mock.insert(MockDevice::new("/devices/pci0000:00/usb1").subsystem("usb").devtype("usb_device"));
        mock.insert(
            MockDevice::new("/devices/pci0000:00/usb1/1-1")
                .subsystem("usb")
                .devtype("usb_device")
                .property("ID_VENDOR_ID", "046d")
                .tag("seat")
                .attribute("idProduct", "c33c"),
        );
        mock.insert(
            MockDevice::new("/devices/pci0000:00/usb1/1-1/1-1:1.0")
                .subsystem("usb")
                .devtype("usb_interface"),
        );
        mock.insert(
            MockDevice::new("/devices/pci0000:00/usb1/1-1/1-1:1.0/hidraw/hidraw0")
                .subsystem("hidraw")
                .devnode("/dev/hidraw0"),
        );
        mock.insert(
            MockDevice::new("/devices/pci0000:00/usb1/1-1/1-1:1.1/hidraw/hidraw1")
                .subsystem("hidraw")
                .devnode("/dev/hidraw1"),
        );
        mock
    }

    #[test]
    fn test_builder_defaults() {
        let dev = Description::builder("/devices/virtual/misc/uinput").build();
        assert_eq!(dev.sysname(), "uinput");
        assert_eq!(dev.syspath(), Path::new("/sys/devices/virtual/misc/uinput"));
        assert!(dev.devnode().is_none());
        assert!(dev.is_initialized());
        assert_eq!(dev.seqnum(), 0);
    }

    #[test]
    fn test_tags_keep_order_and_duplicates() {
        let dev = Description::builder("/devices/a")
            .tag("uaccess")
            .tag("seat")
            .tag("uaccess")
            .build();
        assert_eq!(dev.tags(), &vec!["uaccess", "seat", "uaccess"]);
        assert!(dev.has_tag("seat"));
        assert!(!dev.has_tag("power-switch"));
    }

    #[test]
    fn test_clone_is_independent_snapshot() {
        let dev = Description::builder("/devices/a")
            .property("ID_MODEL", "G410")
            .attribute("name", "keyboard")
            .build();
        let copy = dev.clone();
        drop(dev);
        assert_eq!(copy.property("ID_MODEL"), Some("G410"));
        assert_eq!(copy.attribute("name"), Some("keyboard"));
    }

    #[test]
    fn test_parent() {
        let mock = keyboard_tree();
        let hidraw = mock.describe("/devices/pci0000:00/usb1/1-1/1-1:1.0/hidraw/hidraw0").unwrap();
        // hidraw/ directory is not a device, the interface is the parent
        let parent = hidraw.parent().unwrap();
        assert_eq!(parent.devpath(), "/devices/pci0000:00/usb1/1-1/1-1:1.0");

        let root = mock.describe("/devices/pci0000:00/usb1").unwrap();
        assert!(root.parent().unwrap_err().is_not_found());
    }

    #[test]
    fn test_parent_with_type_walks_ancestors() {
        let mock = keyboard_tree();
        let hidraw = mock.describe("/devices/pci0000:00/usb1/1-1/1-1:1.0/hidraw/hidraw0").unwrap();

        let usb = hidraw.parent_with_type("usb", Some("usb_device")).unwrap();
        assert_eq!(usb.devpath(), "/devices/pci0000:00/usb1/1-1");

        let any_usb = hidraw.parent_with_type("usb", None).unwrap();
        assert_eq!(any_usb.devpath(), "/devices/pci0000:00/usb1/1-1/1-1:1.0");

        let empty_devtype = hidraw.parent_with_type("usb", Some("")).unwrap();
        assert_eq!(empty_devtype, any_usb);
    }

    #[test]
    fn test_parent_with_type_immediate_parent_snapshot() {
        let mock = keyboard_tree();
        let interface = mock.describe("/devices/pci0000:00/usb1/1-1/1-1:1.0").unwrap();
        let expected = mock.describe("/devices/pci0000:00/usb1/1-1").unwrap();

        let parent = interface.parent_with_type("usb", Some("usb_device")).unwrap();
        assert_eq!(parent, expected);
        assert_eq!(parent.properties(), expected.properties());
        assert_eq!(parent.tags(), expected.tags());
        assert_eq!(parent.attributes(), expected.attributes());
    }

    #[test]
    fn test_parent_with_type_not_found() {
        let mock = keyboard_tree();
        let hidraw = mock.describe("/devices/pci0000:00/usb1/1-1/1-1:1.0/hidraw/hidraw0").unwrap();
        let err = hidraw.parent_with_type("input", None).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_detached_description_has_no_parent() {
        let dev = Description::builder("/devices/a").build();
        assert!(dev.parent().unwrap_err().is_not_found());
        assert!(dev.descendants_with_type("hidraw").unwrap().is_empty());
    }

    #[test]
    fn test_descendants_with_type() {
        let mock = keyboard_tree();
        let usb = mock.describe("/devices/pci0000:00/usb1/1-1").unwrap();

        let mut nodes: Vec<String> = usb
            .descendants_with_type("hidraw")
            .unwrap()
            .iter()
            .map(|d| d.sysname().to_string())
            .collect();
        nodes.sort();
        assert_eq!(nodes, vec!["hidraw0", "hidraw1"]);

        assert!(usb.descendants_with_type("input").unwrap().is_empty());
    }

    #[test]
    fn test_serialize_skips_tree() {
        let mock = keyboard_tree();
        let hidraw = mock.describe("/devices/pci0000:00/usb1/1-1/1-1:1.0/hidraw/hidraw0").unwrap();
        let json = serde_json::to_value(&hidraw).unwrap();
        assert_eq!(json["devnode"], "/dev/hidraw0");
        assert_eq!(json["subsystem"], "hidraw");
        assert!(json.get("tree").is_none());
    }
}
