//! sysfs + udev database device matcher.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::warn;

use super::uevent;
use super::uevent::UeventMessage;
use super::uevent::UeventSocket;
use super::DeviceError;
use super::DeviceEvent;
use super::DeviceEventStream;
use super::DeviceAction;
use super::DeviceHandle;
use super::DeviceInfo;
use super::DeviceMatcher;
use super::MatchFilter;

const MESSAGE_BUFFER_BYTES: usize = 16 * 1024;

/// Device directories under sysfs listing every device with a node, keyed by `major:minor`.
const DEVICE_NODE_DIRS: [(char, &str); 2] = [('c', "dev/char"), ('b', "dev/block")];

/// Discovers devices by walking sysfs and merging the udev database.
///
/// Only devices udev has finished processing (those with a database record)
/// are reported, matching what `udevadm info` shows as initialized.
#[derive(Debug, Clone)]
pub struct SysfsMatcher {
    sysfs_root: PathBuf,
    udev_data_dir: PathBuf,
    dev_root: PathBuf,
}

/// A device read from sysfs together with what a container binding needs.
struct SysDevice {
    info: DeviceInfo,
    devlinks: Vec<PathBuf>,
    devname: Option<PathBuf>,
}

impl SysfsMatcher {
    pub fn new(
        sysfs_root: impl Into<PathBuf>,
        udev_data_dir: impl Into<PathBuf>,
        dev_root: impl Into<PathBuf>,
    ) -> Self {
        let sysfs_root = sysfs_root.into();
        // identities are canonical paths, so the root has to be canonical too
        let sysfs_root = fs::canonicalize(&sysfs_root).unwrap_or(sysfs_root);
        Self {
            sysfs_root,
            udev_data_dir: udev_data_dir.into(),
            dev_root: dev_root.into(),
        }
    }

    /// Map a uevent onto the same identity enumeration produces.
    ///
    /// Returns `None` for presence events of devices without a device node,
    /// which enumeration would never report either.
    pub fn event_from_message(&self, message: UeventMessage) -> Option<DeviceEvent> {
        event_from_message(&self.sysfs_root, message)
    }

    fn read_device(&self, syspath: &Path) -> Result<Option<SysDevice>, Report<DeviceError>> {
        let read_error = || DeviceError::ReadDevice {
            identity: syspath.display().to_string(),
        };

        let uevent = fs::read_to_string(syspath.join("uevent")).change_context_lazy(read_error)?;
        let mut properties: BTreeMap<String, String> = uevent
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();

        let (Some(major), Some(minor)) = (properties.get("MAJOR"), properties.get("MINOR")) else {
            return Ok(None);
        };

        let subsystem = fs::read_link(syspath.join("subsystem"))
            .ok()
            .and_then(|link| link.file_name().map(|n| n.to_string_lossy().into_owned()));
        let kind = if subsystem.as_deref() == Some("block") {
            'b'
        } else {
            'c'
        };

        let record_path = self.udev_data_dir.join(format!("{kind}{major}:{minor}"));
        let record = match fs::read_to_string(&record_path) {
            Ok(record) => record,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} is not initialized by udev yet", syspath.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(Report::new(e)
                    .change_context(read_error())
                    .attach_printable(format!("udev record {}", record_path.display())))
            }
        };

        if let Some(subsystem) = subsystem {
            properties.insert("SUBSYSTEM".to_string(), subsystem);
        }
        if let Ok(relative) = syspath.strip_prefix(&self.sysfs_root) {
            properties.insert("DEVPATH".to_string(), format!("/{}", relative.display()));
        }

        let mut devlinks = Vec::new();
        for line in record.lines() {
            if let Some(property) = line.strip_prefix("E:") {
                if let Some((key, value)) = property.split_once('=') {
                    properties.insert(key.to_string(), value.to_string());
                }
            } else if let Some(link) = line.strip_prefix("S:") {
                devlinks.push(self.dev_root.join(link));
            }
        }
        devlinks.sort();

        let devname = properties
            .get("DEVNAME")
            .map(|name| self.dev_root.join(name.trim_start_matches("/dev/")));
        if let Some(devname) = &devname {
            properties.insert("DEVNAME".to_string(), devname.display().to_string());
        }
        if !devlinks.is_empty() {
            let joined = devlinks
                .iter()
                .map(|link| link.display().to_string())
                .collect::<Vec<_>>()
                .join(" ");
            properties.insert("DEVLINKS".to_string(), joined);
        }

        Ok(Some(SysDevice {
            info: DeviceInfo {
                handle: DeviceHandle::from_syspath(syspath),
                properties,
            },
            devlinks,
            devname,
        }))
    }
}

/// Properties a uevent carries only for devices with a node under `/dev`.
const DEVICE_NODE_PROPERTIES: [&str; 3] = ["MAJOR", "MINOR", "DEVNAME"];

fn event_from_message(sysfs_root: &Path, message: UeventMessage) -> Option<DeviceEvent> {
    let syspath = sysfs_root.join(message.devpath.trim_start_matches('/'));
    let action = DeviceAction::parse(&message.action);
    let has_node = DEVICE_NODE_PROPERTIES
        .iter()
        .all(|key| message.properties.contains_key(*key));
    if action.is_presence() && !has_node {
        debug!("ignoring {action} of {} without a device node", syspath.display());
        return None;
    }
    Some(DeviceEvent {
        action,
        device: DeviceInfo {
            handle: DeviceHandle::from_syspath(&syspath),
            properties: message.properties,
        },
    })
}

impl DeviceMatcher for SysfsMatcher {
    fn enumerate(&self, filter: &MatchFilter) -> Result<Vec<DeviceInfo>, Report<DeviceError>> {
        let mut devices = BTreeMap::new();

        for (_, dir) in DEVICE_NODE_DIRS {
            let dir = self.sysfs_root.join(dir);
            let enumerate_error = || DeviceError::Enumerate {
                path: dir.display().to_string(),
            };
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Report::new(e).change_context(enumerate_error())),
            };

            for entry in entries {
                let entry = entry.change_context_lazy(enumerate_error)?;
                // the device may vanish between readdir and canonicalize
                let syspath = match fs::canonicalize(entry.path()) {
                    Ok(syspath) => syspath,
                    Err(e) => {
                        debug!("skipping {}: {e}", entry.path().display());
                        continue;
                    }
                };
                match self.read_device(&syspath) {
                    Ok(Some(device)) if filter.matches(&device.info.properties) => {
                        devices.insert(device.info.handle.clone(), device.info);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("skipping unreadable device: {e:?}"),
                }
            }
        }

        Ok(devices.into_values().collect())
    }

    fn resolve(&self, handle: &DeviceHandle) -> Result<PathBuf, Report<DeviceError>> {
        let no_node = || DeviceError::NoDeviceNode {
            identity: handle.to_string(),
        };
        let device = self.read_device(handle.as_path())?.ok_or_else(|| Report::new(no_node()))?;
        device
            .devlinks
            .into_iter()
            .next()
            .or(device.devname)
            .ok_or_else(|| Report::new(no_node()))
    }

    fn events(&self) -> Result<DeviceEventStream, Report<DeviceError>> {
        let socket = UeventSocket::bind().change_context(DeviceError::Monitor {
            message: "failed to bind udev netlink socket".to_string(),
        })?;
        let sysfs_root = self.sysfs_root.clone();

        let stream = async_stream::stream! {
            let mut buf = vec![0u8; MESSAGE_BUFFER_BYTES];
            loop {
                match socket.recv(&mut buf).await {
                    Ok(0) => continue,
                    Ok(len) => match uevent::parse_message(&buf[..len]) {
                        Ok(message) => {
                            if let Some(event) = event_from_message(&sysfs_root, message) {
                                yield Ok(event);
                            }
                        }
                        Err(e) => yield Err(e),
                    },
                    Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                        yield Err(Report::new(e).change_context(DeviceError::Monitor {
                            message: "uevent receive buffer overflowed, events were dropped".to_string(),
                        }));
                    }
                    Err(e) => {
                        yield Err(Report::new(e).change_context(DeviceError::Monitor {
                            message: "uevent socket failed".to_string(),
                        }));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
