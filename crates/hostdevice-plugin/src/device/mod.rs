//! Device discovery.
//!
//! A [`DeviceMatcher`] enumerates the devices currently present on the host,
//! resolves a device to the node a container should see, and streams
//! hotplug notifications. The daemon uses [`SysfsMatcher`], which reads sysfs
//! and the udev database and listens to udev over netlink; tests use
//! `mock::MockMatcher`.

#[cfg(test)]
pub(crate) mod mock;
pub mod sysfs;
pub mod uevent;

use core::error::Error;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;

use derive_more::Display;
use error_stack::Report;
use futures::Stream;
use serde::Deserialize;
use serde::Serialize;

pub use sysfs::SysfsMatcher;

/// Stable identity of a device: its kernel object path under sysfs.
///
/// The identity does not change while the device stays plugged in, unlike
/// `/dev` names which the kernel may hand out again to another device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceHandle(String);

impl DeviceHandle {
    pub fn new(syspath: impl Into<String>) -> Self {
        Self(syspath.into())
    }

    pub fn from_syspath(syspath: &Path) -> Self {
        Self(syspath.to_string_lossy().into_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Property predicates a device must satisfy to belong to a resource.
///
/// Every key must be present on the device with exactly the given value.
/// An empty filter matches every device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchFilter(BTreeMap<String, String>);

impl MatchFilter {
    pub fn matches(&self, properties: &BTreeMap<String, String>) -> bool {
        self.0
            .iter()
            .all(|(key, value)| properties.get(key) == Some(value))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl FromIterator<(String, String)> for MatchFilter {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A device as seen by the matcher: its identity plus udev properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub handle: DeviceHandle,
    pub properties: BTreeMap<String, String>,
}

impl DeviceInfo {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Symlinks udev created for the device node, in `DEVLINKS` order.
    pub fn devlinks(&self) -> impl Iterator<Item = &str> {
        self.property("DEVLINKS")
            .unwrap_or_default()
            .split_whitespace()
    }
}

/// Hotplug action reported for a device.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum DeviceAction {
    #[display("add")]
    Add,
    #[display("change")]
    Change,
    #[display("remove")]
    Remove,
    #[display("online")]
    Online,
    #[display("{_0}")]
    Other(String),
}

impl DeviceAction {
    pub fn parse(action: &str) -> Self {
        match action {
            "add" => Self::Add,
            "change" => Self::Change,
            "remove" => Self::Remove,
            "online" => Self::Online,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether the device is present after this action.
    pub fn is_presence(&self) -> bool {
        matches!(self, Self::Add | Self::Change | Self::Online)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub action: DeviceAction,
    pub device: DeviceInfo,
}

pub type DeviceEventStream =
    Pin<Box<dyn Stream<Item = Result<DeviceEvent, Report<DeviceError>>> + Send>>;

/// Errors raised while discovering or watching devices.
#[derive(Debug, Display)]
pub enum DeviceError {
    #[display("failed to enumerate devices under {path}")]
    Enumerate { path: String },
    #[display("failed to read device {identity}")]
    ReadDevice { identity: String },
    #[display("device {identity} has no device node")]
    NoDeviceNode { identity: String },
    #[display("failed to monitor device events: {message}")]
    Monitor { message: String },
    #[display("malformed device event: {message}")]
    MalformedEvent { message: String },
}

impl Error for DeviceError {}

/// Access to the host's devices.
pub trait DeviceMatcher: Send + Sync {
    /// Lists the initialized devices whose properties satisfy `filter`, ordered by identity.
    fn enumerate(&self, filter: &MatchFilter) -> Result<Vec<DeviceInfo>, Report<DeviceError>>;

    /// Returns the host path a container binding should point at.
    fn resolve(&self, handle: &DeviceHandle) -> Result<PathBuf, Report<DeviceError>>;

    /// Opens a stream of hotplug events for every device on the host.
    fn events(&self) -> Result<DeviceEventStream, Report<DeviceError>>;
}
