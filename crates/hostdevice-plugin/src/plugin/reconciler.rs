//! Keeps each server's inventory in step with the devices on the host.

use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::info;

use super::DeviceRecord;
use super::Inventory;
use super::PluginError;
use super::ResourcePluginServer;
use crate::config::ResourceConfig;
use crate::device::DeviceEvent;
use crate::device::DeviceMatcher;

pub struct InventoryReconciler {
    matcher: Arc<dyn DeviceMatcher>,
}

impl InventoryReconciler {
    pub fn new(matcher: Arc<dyn DeviceMatcher>) -> Self {
        Self { matcher }
    }

    pub fn matcher(&self) -> &Arc<dyn DeviceMatcher> {
        &self.matcher
    }

    /// Every present device matching the resource's filter, all healthy.
    pub fn enumerate(&self, resource: &ResourceConfig) -> Result<Inventory, Report<PluginError>> {
        let devices = self
            .matcher
            .enumerate(&resource.filter)
            .change_context_lazy(|| PluginError::Enumeration {
                resource: resource.name.clone(),
            })?;
        Ok(devices
            .into_iter()
            .map(|device| DeviceRecord::healthy(device.handle))
            .collect())
    }

    /// Re-enumerate and replace the server's inventory. Returns whether it changed.
    pub fn refresh(&self, server: &ResourcePluginServer) -> Result<bool, Report<PluginError>> {
        let inventory = self.enumerate(server.resource())?;
        let count = inventory.len();
        let changed = server.hub().replace(inventory);
        if changed {
            info!(resource = %server.name(), devices = count, "device list changed on refresh");
        }
        Ok(changed)
    }

    /// Apply one hotplug event if it concerns the server's resource.
    pub fn apply_event(&self, server: &ResourcePluginServer, event: &DeviceEvent) -> bool {
        if !server.resource().filter.matches(&event.device.properties) {
            return false;
        }
        let changed = server.hub().update(|inventory| apply_action(inventory, event));
        if changed {
            info!(
                resource = %server.name(),
                action = %event.action,
                device = %event.device.handle,
                "device list updated"
            );
        } else {
            debug!(
                resource = %server.name(),
                action = %event.action,
                device = %event.device.handle,
                "device event left device list unchanged"
            );
        }
        changed
    }
}

/// Presence actions upsert a healthy record; anything else drops the device.
pub fn apply_action(inventory: &mut Inventory, event: &DeviceEvent) -> bool {
    if event.action.is_presence() {
        inventory.upsert(DeviceRecord::healthy(event.device.handle.clone()))
    } else {
        inventory.remove(&event.device.handle)
    }
}
