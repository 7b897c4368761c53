//! Allocate request validation and device resolution.

use core::error::Error;
use std::collections::HashMap;

use derive_more::Display;
use tonic::Status;

use super::api::v1beta1::AllocateRequest;
use super::api::v1beta1::AllocateResponse;
use super::api::v1beta1::ContainerAllocateResponse;
use super::api::v1beta1::DeviceSpec;
use super::Health;
use super::Inventory;
use crate::config::ResourceConfig;
use crate::device::DeviceHandle;
use crate::device::DeviceMatcher;

/// Reasons an allocation is rejected. Any of them fails the whole request.
#[derive(Debug, Display, PartialEq, Eq)]
pub enum AllocationError {
    #[display("invalid allocation request with non-existing device {device_id}")]
    UnknownDevice { device_id: String },
    #[display("invalid allocation request with unhealthy device: {device_id}")]
    UnhealthyDevice { device_id: String },
    #[display("permissions for device cannot be empty for device {device_id}")]
    MissingPermissions { device_id: String },
    #[display("failed to resolve host path of device {device_id}: {message}")]
    Unresolvable { device_id: String, message: String },
}

impl Error for AllocationError {}

impl From<AllocationError> for Status {
    fn from(err: AllocationError) -> Self {
        let message = err.to_string();
        match err {
            AllocationError::UnknownDevice { .. } => Status::not_found(message),
            AllocationError::UnhealthyDevice { .. } => Status::failed_precondition(message),
            AllocationError::MissingPermissions { .. } => Status::invalid_argument(message),
            AllocationError::Unresolvable { .. } => Status::internal(message),
        }
    }
}

/// Build the device bindings for every container in `request`.
///
/// Every requested id is checked against `inventory` before any host path is
/// resolved, so a rejected request never touches the matcher.
pub fn allocate(
    resource: &ResourceConfig,
    inventory: &Inventory,
    matcher: &dyn DeviceMatcher,
    request: &AllocateRequest,
) -> Result<AllocateResponse, AllocationError> {
    for container in &request.container_requests {
        for device_id in &container.devices_ids {
            validate(resource, inventory, device_id)?;
        }
    }

    let container_responses = request
        .container_requests
        .iter()
        .map(|container| {
            let devices = container
                .devices_ids
                .iter()
                .map(|device_id| {
                    let host_path = matcher
                        .resolve(&DeviceHandle::new(device_id.as_str()))
                        .map_err(|report| AllocationError::Unresolvable {
                            device_id: device_id.clone(),
                            message: report.current_context().to_string(),
                        })?;
                    Ok(DeviceSpec {
                        container_path: resource.container_path.clone(),
                        host_path: host_path.to_string_lossy().into_owned(),
                        permissions: resource.permissions.clone(),
                    })
                })
                .collect::<Result<Vec<_>, AllocationError>>()?;
            Ok(ContainerAllocateResponse {
                envs: HashMap::new(),
                mounts: Vec::new(),
                devices,
                annotations: HashMap::new(),
                cdi_devices: Vec::new(),
            })
        })
        .collect::<Result<Vec<_>, AllocationError>>()?;

    Ok(AllocateResponse {
        container_responses,
    })
}

fn validate(
    resource: &ResourceConfig,
    inventory: &Inventory,
    device_id: &str,
) -> Result<(), AllocationError> {
    let device_id = device_id.to_string();
    match inventory.health(&DeviceHandle::new(device_id.as_str())) {
        None => Err(AllocationError::UnknownDevice { device_id }),
        Some(Health::Unhealthy) => Err(AllocationError::UnhealthyDevice { device_id }),
        Some(Health::Healthy) if resource.permissions.is_empty() => {
            Err(AllocationError::MissingPermissions { device_id })
        }
        Some(Health::Healthy) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use tonic::Code;

    use super::*;
    use crate::device::mock::MockMatcher;
    use crate::device::MatchFilter;
    use crate::plugin::api::v1beta1::ContainerAllocateRequest;
    use crate::plugin::DeviceRecord;

    const SERIAL: &str = "/sys/devices/pci0000:00/usb1/1-1/ttyUSB0/tty/ttyUSB0";
    const MODEM: &str = "/sys/devices/pci0000:00/usb1/1-2/ttyACM0/tty/ttyACM0";

    fn resource(permissions: &str) -> ResourceConfig {
        ResourceConfig {
            name: "example.com/serial".to_string(),
            container_path: "/dev/ttyUSB0".to_string(),
            permissions: permissions.to_string(),
            filter: MatchFilter::default(),
        }
    }

    fn request(containers: &[&[&str]]) -> AllocateRequest {
        AllocateRequest {
            container_requests: containers
                .iter()
                .map(|ids| ContainerAllocateRequest {
                    devices_ids: ids.iter().map(|id| id.to_string()).collect(),
                })
                .collect(),
        }
    }

    fn setup() -> (MockMatcher, Inventory) {
        let matcher = MockMatcher::new();
        matcher.insert(
            MockMatcher::device(SERIAL, &[("SUBSYSTEM", "tty")]),
            "/dev/serial/by-id/usb-FTDI-ABC123",
        );
        matcher.insert(
            MockMatcher::device(MODEM, &[("SUBSYSTEM", "tty")]),
            "/dev/serial/by-id/usb-Modem",
        );
        let inventory = [SERIAL, MODEM]
            .into_iter()
            .map(|id| DeviceRecord::healthy(DeviceHandle::new(id)))
            .collect();
        (matcher, inventory)
    }

    #[test]
    fn binds_each_device_to_the_container_path() {
        let (matcher, inventory) = setup();

        let response = allocate(
            &resource("rw"),
            &inventory,
            &matcher,
            &request(&[&[SERIAL], &[MODEM, SERIAL]]),
        )
        .expect("should allocate");

        assert_eq!(response.container_responses.len(), 2);
        assert_eq!(
            response.container_responses[0].devices,
            vec![DeviceSpec {
                container_path: "/dev/ttyUSB0".to_string(),
                host_path: "/dev/serial/by-id/usb-FTDI-ABC123".to_string(),
                permissions: "rw".to_string(),
            }]
        );
        let hosts: Vec<_> = response.container_responses[1]
            .devices
            .iter()
            .map(|spec| spec.host_path.as_str())
            .collect();
        assert_eq!(
            hosts,
            vec!["/dev/serial/by-id/usb-Modem", "/dev/serial/by-id/usb-FTDI-ABC123"]
        );
    }

    #[test]
    fn unknown_device_rejects_whole_request() {
        let (matcher, inventory) = setup();

        let err = allocate(
            &resource("rw"),
            &inventory,
            &matcher,
            &request(&[&[SERIAL], &["/sys/devices/missing"]]),
        )
        .expect_err("should reject");

        assert_eq!(
            err,
            AllocationError::UnknownDevice {
                device_id: "/sys/devices/missing".to_string()
            }
        );
        assert_eq!(Status::from(err).code(), Code::NotFound);
    }

    #[test]
    fn unhealthy_device_is_rejected() {
        let (matcher, mut inventory) = setup();
        inventory.upsert(DeviceRecord {
            identity: DeviceHandle::new(MODEM),
            health: Health::Unhealthy,
        });

        let err = allocate(&resource("rw"), &inventory, &matcher, &request(&[&[MODEM]]))
            .expect_err("should reject");

        assert!(matches!(err, AllocationError::UnhealthyDevice { .. }));
        assert_eq!(Status::from(err).code(), Code::FailedPrecondition);
    }

    #[test]
    fn empty_permissions_are_rejected() {
        let (matcher, inventory) = setup();

        let err = allocate(&resource(""), &inventory, &matcher, &request(&[&[SERIAL]]))
            .expect_err("should reject");

        assert_eq!(
            err.to_string(),
            format!("permissions for device cannot be empty for device {SERIAL}")
        );
        assert_eq!(Status::from(err).code(), Code::InvalidArgument);
    }

    #[test]
    fn unresolvable_device_is_internal() {
        let (matcher, inventory) = setup();
        // still advertised, but gone from the host
        matcher.unplug(&DeviceHandle::new(SERIAL));

        let err = allocate(&resource("rw"), &inventory, &matcher, &request(&[&[SERIAL]]))
            .expect_err("should reject");

        assert!(matches!(err, AllocationError::Unresolvable { .. }));
        assert_eq!(Status::from(err).code(), Code::Internal);
    }

    #[test]
    fn empty_request_yields_empty_response() {
        let (matcher, inventory) = setup();

        let response = allocate(&resource("rw"), &inventory, &matcher, &request(&[]))
            .expect("should allocate");
        assert!(response.container_responses.is_empty());
    }
}
