//! In-memory device matcher for tests and dry runs.
//!
//! Devices are plugged and unplugged by hand; every change is also broadcast
//! to the event streams opened through [`DeviceMatcher::events`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use error_stack::Report;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::DeviceAction;
use super::DeviceError;
use super::DeviceEvent;
use super::DeviceEventStream;
use super::DeviceHandle;
use super::DeviceInfo;
use super::DeviceMatcher;
use super::MatchFilter;

#[derive(Default)]
struct MockState {
    devices: BTreeMap<DeviceHandle, (DeviceInfo, PathBuf)>,
    listeners: Vec<mpsc::UnboundedSender<DeviceEvent>>,
    fail_enumeration: bool,
}

/// Mock device matcher with scripted devices.
#[derive(Clone, Default)]
pub struct MockMatcher {
    state: Arc<Mutex<MockState>>,
}

impl MockMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Build a device with the given identity and properties.
    pub fn device(identity: &str, properties: &[(&str, &str)]) -> DeviceInfo {
        DeviceInfo {
            handle: DeviceHandle::new(identity),
            properties: properties
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Make a device present without emitting an event.
    pub fn insert(&self, device: DeviceInfo, host_path: impl Into<PathBuf>) {
        let host_path = host_path.into();
        self.with_state(|state| {
            state
                .devices
                .insert(device.handle.clone(), (device, host_path));
        });
    }

    /// Make a device present and emit an `add` event.
    pub fn plug(&self, device: DeviceInfo, host_path: impl Into<PathBuf>) {
        self.insert(device.clone(), host_path);
        self.emit(DeviceEvent {
            action: DeviceAction::Add,
            device,
        });
    }

    /// Remove a device and emit a `remove` event carrying its last known properties.
    pub fn unplug(&self, handle: &DeviceHandle) -> Option<DeviceInfo> {
        let removed = self.with_state(|state| state.devices.remove(handle));
        let (device, _) = removed?;
        self.emit(DeviceEvent {
            action: DeviceAction::Remove,
            device: device.clone(),
        });
        Some(device)
    }

    /// Deliver an arbitrary event to every open stream.
    pub fn emit(&self, event: DeviceEvent) {
        self.with_state(|state| {
            state
                .listeners
                .retain(|listener| listener.send(event.clone()).is_ok());
        });
    }

    /// Make subsequent enumerations fail.
    pub fn fail_enumeration(&self, fail: bool) {
        self.with_state(|state| state.fail_enumeration = fail);
    }

    /// Close every open event stream.
    pub fn close_streams(&self) {
        self.with_state(|state| state.listeners.clear());
    }
}

impl DeviceMatcher for MockMatcher {
    fn enumerate(&self, filter: &MatchFilter) -> Result<Vec<DeviceInfo>, Report<DeviceError>> {
        self.with_state(|state| {
            if state.fail_enumeration {
                return Err(Report::new(DeviceError::Enumerate {
                    path: "mock".to_string(),
                }));
            }
            Ok(state
                .devices
                .values()
                .filter(|(device, _)| filter.matches(&device.properties))
                .map(|(device, _)| device.clone())
                .collect())
        })
    }

    fn resolve(&self, handle: &DeviceHandle) -> Result<PathBuf, Report<DeviceError>> {
        self.with_state(|state| {
            state
                .devices
                .get(handle)
                .map(|(_, host_path)| host_path.clone())
                .ok_or_else(|| {
                    Report::new(DeviceError::NoDeviceNode {
                        identity: handle.to_string(),
                    })
                })
        })
    }

    fn events(&self) -> Result<DeviceEventStream, Report<DeviceError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.with_state(|state| state.listeners.push(tx));
        Ok(Box::pin(UnboundedReceiverStream::new(rx).map(Ok)))
    }
}
