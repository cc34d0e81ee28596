//! Device filtering strategies
//!
//! A [`DeviceFilter`] narrows what a watcher enumerates and monitors, and
//! decides which of the resulting devices are visible to consumers.

use serde::{Deserialize, Serialize};

use crate::description::{AttributeMap, Description, PropertyMap, TagList};
use crate::subsystem::{EnumerationScope, MonitorScope};

/// Filtering policy plugged into a [`DeviceWatcher`](crate::DeviceWatcher)
pub trait DeviceFilter {
    /// Constraints for enumeration passes
    fn enumeration_scope(&self) -> EnumerationScope {
        EnumerationScope::default()
    }

    /// Constraints for the monitoring subscription
    fn monitor_scope(&self) -> MonitorScope {
        MonitorScope::default()
    }

    /// Whether a device should be reported
    fn is_visible(&self, _dev: &Description) -> bool {
        true
    }
}

/// Filter that lets every device through
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl DeviceFilter for AcceptAll {}

/// Fixed rule set; a device is visible only if it passes every rule
///
/// Unset rules always pass. Rules must not be changed while the watcher
/// using them is active.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsystem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devtype: Option<String>,
    #[serde(default)]
    pub tags: TagList,
    #[serde(default)]
    pub properties: PropertyMap,
    #[serde(default)]
    pub attributes: AttributeMap,
}

impl MatchRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_subsystem(&mut self, subsystem: impl Into<String>) {
        self.subsystem = Some(subsystem.into());
    }

    pub fn set_devtype(&mut self, devtype: impl Into<String>) {
        self.devtype = Some(devtype.into());
    }

    pub fn add_property(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(name.into(), value.into());
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        self.tags.push(tag.into());
    }

    pub fn add_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(name.into(), value.into());
    }

    /// Whether no rule is set at all
    pub fn is_empty(&self) -> bool {
        self.subsystem.is_none()
            && self.devtype.is_none()
            && self.properties.is_empty()
            && self.tags.is_empty()
            && self.attributes.is_empty()
    }
}

impl DeviceFilter for MatchRules {
    fn enumeration_scope(&self) -> EnumerationScope {
        EnumerationScope {
            subsystem: self.subsystem.clone(),
            devtype: self.devtype.clone(),
            properties: self.properties.clone(),
            tags: self.tags.clone(),
        }
    }

    // Properties and tags cannot be filtered by the subscription itself
    fn monitor_scope(&self) -> MonitorScope {
        MonitorScope {
            subsystem: self.subsystem.clone(),
            devtype: self.devtype.clone(),
        }
    }

    fn is_visible(&self, dev: &Description) -> bool {
        if let Some(subsystem) = &self.subsystem {
            if dev.subsystem() != Some(subsystem.as_str()) {
                return false;
            }
        }
        if let Some(devtype) = &self.devtype {
            if dev.devtype() != Some(devtype.as_str()) {
                return false;
            }
        }
        let properties_ok = self
            .properties
            .iter()
            .all(|(key, value)| dev.properties().get(key) == Some(value));
        let tags_ok = self.tags.iter().all(|tag| dev.has_tag(tag));
        let attributes_ok = self
            .attributes
            .iter()
            .all(|(key, value)| dev.attributes().get(key) == Some(value));

        properties_ok && tags_ok && attributes_ok
    }
}
