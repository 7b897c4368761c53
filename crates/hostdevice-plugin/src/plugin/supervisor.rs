//! Owns the running plugin server of every configured resource.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::InventoryReconciler;
use super::PluginError;
use super::ResourcePluginServer;
use crate::config::PluginConfig;
use crate::device::DeviceEvent;
use crate::device::DeviceMatcher;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Kubelet's device plugin directory; socket prefixes and endpoints are relative to it.
    pub device_plugin_dir: PathBuf,
    pub kubelet_socket: PathBuf,
    pub dial_timeout: Duration,
}

/// At most one server per resource name. A replacement is only created once
/// its predecessor has fully stopped.
pub struct PluginSupervisor {
    reconciler: InventoryReconciler,
    settings: SupervisorSettings,
    instances: BTreeMap<String, ResourcePluginServer>,
}

impl PluginSupervisor {
    pub fn new(matcher: Arc<dyn DeviceMatcher>, settings: SupervisorSettings) -> Self {
        Self {
            reconciler: InventoryReconciler::new(matcher),
            settings,
            instances: BTreeMap::new(),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn matcher(&self) -> &Arc<dyn DeviceMatcher> {
        self.reconciler.matcher()
    }

    pub fn get(&self, resource_name: &str) -> Option<&ResourcePluginServer> {
        self.instances.get(resource_name)
    }

    pub fn instances(&self) -> impl Iterator<Item = &ResourcePluginServer> {
        self.instances.values()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Start and register a server for every configured resource, in name order.
    ///
    /// Stops at the first failure. Servers created before it stay tracked.
    pub async fn create_all(&mut self, config: &PluginConfig) -> Result<(), Report<PluginError>> {
        let socket_dir = config.socket_dir(&self.settings.device_plugin_dir);
        fs::create_dir_all(&socket_dir).change_context_lazy(|| PluginError::SocketDir {
            path: socket_dir.display().to_string(),
        })?;

        for resource in config.resources() {
            if let Some(mut previous) = self.instances.remove(&resource.name) {
                warn!(resource = %resource.name, "replacing running plugin server");
                if let Err(e) = previous.stop().await {
                    error!(resource = %resource.name, "failed to stop previous plugin server: {e:?}");
                }
            }

            let inventory = self.reconciler.enumerate(&resource)?;
            info!(
                resource = %resource.name,
                devices = inventory.len(),
                "creating device plugin"
            );

            let name = resource.name.clone();
            let socket_path = socket_dir.join(resource.socket_file_name());
            let endpoint = config.endpoint(&resource);
            let mut server = ResourcePluginServer::new(
                resource,
                socket_path,
                endpoint,
                inventory,
                self.reconciler.matcher().clone(),
                self.settings.dial_timeout,
            );

            let started = match server.start().await {
                Ok(()) => server.register(&self.settings.kubelet_socket).await,
                Err(e) => Err(e),
            };
            if let Err(e) = started {
                if let Err(stop_error) = server.stop().await {
                    error!(resource = %name, "failed to clean up plugin server: {stop_error:?}");
                }
                return Err(e);
            }
            self.instances.insert(name, server);
        }
        Ok(())
    }

    /// Stop every server. Failures are logged and do not stop the others.
    pub async fn stop_all(&mut self) {
        let instances = std::mem::take(&mut self.instances);
        if instances.is_empty() {
            return;
        }
        info!("stopping {} device plugins", instances.len());
        for (name, mut server) in instances {
            if let Err(e) = server.stop().await {
                error!(resource = %name, "failed to stop plugin server: {e:?}");
            }
        }
    }

    /// Full refresh of every server. Returns how many inventories changed.
    pub fn refresh_all(&self) -> usize {
        self.instances
            .values()
            .filter(|server| match self.reconciler.refresh(server) {
                Ok(changed) => changed,
                Err(e) => {
                    error!(resource = %server.name(), "failed to refresh devices: {e:?}");
                    false
                }
            })
            .count()
    }

    /// Route a hotplug event to every server whose filter it matches.
    /// Returns how many inventories changed.
    pub fn apply_event(&self, event: &DeviceEvent) -> usize {
        self.instances
            .values()
            .filter(|server| self.reconciler.apply_event(server, event))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;
    use tonic::Code;

    use super::*;
    use crate::device::mock::MockMatcher;
    use crate::device::DeviceAction;
    use crate::device::DeviceHandle;
    use crate::plugin::api::v1beta1::device_plugin_client::DevicePluginClient;
    use crate::plugin::api::v1beta1::AllocateRequest;
    use crate::plugin::api::v1beta1::ContainerAllocateRequest;
    use crate::plugin::api::v1beta1::Empty;
    use crate::plugin::transport;
    use crate::plugin::ServerState;
    use crate::testing::FakeKubelet;

    const SERIAL: &str = "/sys/devices/usb1/1-1/ttyUSB0/tty/ttyUSB0";
    const DISK: &str = "/sys/devices/pci0000:00/ata1/host0/block/sda";

    const CONFIG: &str = r#"{
        "socketPrefix": "hostdevice",
        "devices": {
            "example.com/serial": {
                "containerPath": "/dev/ttyUSB0",
                "permissions": "rw",
                "matchProperties": { "SUBSYSTEM": "tty" }
            },
            "example.com/disk": {
                "containerPath": "/dev/xvda",
                "permissions": "rwm",
                "matchProperties": { "SUBSYSTEM": "block" }
            }
        }
    }"#;

    struct Fixture {
        tmp: tempfile::TempDir,
        matcher: MockMatcher,
        supervisor: PluginSupervisor,
        config: PluginConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().expect("tempdir");
            let matcher = MockMatcher::new();
            matcher.insert(
                MockMatcher::device(SERIAL, &[("SUBSYSTEM", "tty")]),
                "/dev/serial/by-id/usb-ABC123",
            );
            matcher.insert(
                MockMatcher::device(DISK, &[("SUBSYSTEM", "block")]),
                "/dev/disk/by-id/ata-DISK",
            );
            let supervisor = PluginSupervisor::new(
                Arc::new(matcher.clone()),
                SupervisorSettings {
                    device_plugin_dir: tmp.path().to_path_buf(),
                    kubelet_socket: tmp.path().join("kubelet.sock"),
                    dial_timeout: Duration::from_secs(2),
                },
            );
            Self {
                tmp,
                matcher,
                supervisor,
                config: PluginConfig::from_json(CONFIG).expect("config"),
            }
        }
    }

    #[test(tokio::test)]
    async fn create_all_registers_every_resource_in_name_order() {
        let mut fixture = Fixture::new();
        let kubelet = FakeKubelet::start(fixture.tmp.path()).await;

        fixture
            .supervisor
            .create_all(&fixture.config)
            .await
            .expect("create all");

        assert_eq!(
            kubelet.registered_resources(),
            vec!["example.com/disk", "example.com/serial"]
        );
        let endpoints: Vec<_> = kubelet.requests().into_iter().map(|r| r.endpoint).collect();
        assert_eq!(
            endpoints,
            vec![
                "hostdevice/example.com-disk.sock",
                "hostdevice/example.com-serial.sock"
            ]
        );

        let serial = fixture.supervisor.get("example.com/serial").expect("serial");
        assert_eq!(serial.state(), ServerState::Registered);
        assert!(fixture
            .tmp
            .path()
            .join("hostdevice/example.com-serial.sock")
            .exists());
        let inventory = serial.hub().snapshot();
        assert_eq!(inventory.len(), 1);
        assert!(inventory.health(&DeviceHandle::new(SERIAL)).is_some());

        fixture.supervisor.stop_all().await;
        assert!(fixture.supervisor.is_empty());
        assert!(!fixture
            .tmp
            .path()
            .join("hostdevice/example.com-serial.sock")
            .exists());
    }

    #[test(tokio::test)]
    async fn round_trip_from_config_to_allocation() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let matcher = MockMatcher::new();
        matcher.insert(
            MockMatcher::device(SERIAL, &[("SUBSYSTEM", "tty"), ("ID_SERIAL", "ABC123")]),
            "/dev/serial/by-id/usb-ABC123",
        );
        matcher.insert(
            MockMatcher::device(
                "/sys/devices/usb1/1-2/ttyUSB1/tty/ttyUSB1",
                &[("SUBSYSTEM", "tty"), ("ID_SERIAL", "OTHER")],
            ),
            "/dev/serial/by-id/usb-OTHER",
        );
        let mut supervisor = PluginSupervisor::new(
            Arc::new(matcher),
            SupervisorSettings {
                device_plugin_dir: tmp.path().to_path_buf(),
                kubelet_socket: tmp.path().join("kubelet.sock"),
                dial_timeout: Duration::from_secs(2),
            },
        );
        let config = PluginConfig::from_json(
            r#"{"socketPrefix":"x","devices":{"tty0":{"containerPath":"/dev/ttyUSB0","permissions":"rw","matchProperties":{"SUBSYSTEM":"tty","ID_SERIAL":"ABC123"}}}}"#,
        )
        .expect("config");
        let kubelet = FakeKubelet::start(tmp.path()).await;

        supervisor.create_all(&config).await.expect("create all");
        let requests = kubelet.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].resource_name, "tty0");
        assert_eq!(requests[0].endpoint, "x/tty0.sock");

        let channel = transport::connect_unix(&tmp.path().join("x/tty0.sock"), Duration::from_secs(2))
            .await
            .expect("connect");
        let mut client = DevicePluginClient::new(channel);
        let mut stream = client
            .list_and_watch(Empty {})
            .await
            .expect("watch")
            .into_inner();
        let devices = stream.message().await.expect("message").expect("initial").devices;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, SERIAL);
        assert_eq!(devices[0].health, "Healthy");

        let response = client
            .allocate(AllocateRequest {
                container_requests: vec![ContainerAllocateRequest {
                    devices_ids: vec![SERIAL.to_string()],
                }],
            })
            .await
            .expect("allocate")
            .into_inner();
        let mount = &response.container_responses[0].devices[0];
        assert_eq!(mount.host_path, "/dev/serial/by-id/usb-ABC123");
        assert_eq!(mount.container_path, "/dev/ttyUSB0");
        assert_eq!(mount.permissions, "rw");

        supervisor.stop_all().await;
    }

    #[test(tokio::test)]
    async fn create_all_fails_fast_without_kubelet() {
        let mut fixture = Fixture::new();

        let err = fixture
            .supervisor
            .create_all(&fixture.config)
            .await
            .expect_err("no kubelet");

        assert!(matches!(
            err.current_context(),
            PluginError::Registration { resource, .. } if resource == "example.com/disk"
        ));
        assert!(fixture.supervisor.is_empty());
        assert!(!fixture
            .tmp
            .path()
            .join("hostdevice/example.com-disk.sock")
            .exists());
    }

    #[test(tokio::test)]
    async fn create_all_fails_on_enumeration_error() {
        let mut fixture = Fixture::new();
        let _kubelet = FakeKubelet::start(fixture.tmp.path()).await;
        fixture.matcher.fail_enumeration(true);

        let err = fixture
            .supervisor
            .create_all(&fixture.config)
            .await
            .expect_err("enumeration fails");
        assert!(matches!(err.current_context(), PluginError::Enumeration { .. }));
    }

    #[test(tokio::test)]
    async fn events_and_refreshes_reach_matching_servers() {
        let mut fixture = Fixture::new();
        let _kubelet = FakeKubelet::start(fixture.tmp.path()).await;
        fixture
            .supervisor
            .create_all(&fixture.config)
            .await
            .expect("create all");

        let second = "/sys/devices/usb1/1-2/ttyUSB1/tty/ttyUSB1";
        fixture.matcher.plug(
            MockMatcher::device(second, &[("SUBSYSTEM", "tty")]),
            "/dev/serial/by-id/usb-SECOND",
        );
        let event = DeviceEvent {
            action: DeviceAction::Add,
            device: MockMatcher::device(second, &[("SUBSYSTEM", "tty")]),
        };
        assert_eq!(fixture.supervisor.apply_event(&event), 1);
        assert_eq!(
            fixture
                .supervisor
                .get("example.com/serial")
                .expect("serial")
                .hub()
                .snapshot()
                .len(),
            2
        );

        assert_eq!(fixture.supervisor.refresh_all(), 0, "already in sync");
        fixture.matcher.unplug(&DeviceHandle::new(DISK));
        assert_eq!(fixture.supervisor.refresh_all(), 1);
        assert!(fixture
            .supervisor
            .get("example.com/disk")
            .expect("disk")
            .hub()
            .snapshot()
            .is_empty());

        fixture.supervisor.stop_all().await;
    }

    #[test(tokio::test)]
    async fn removed_device_is_withdrawn_and_rejected() {
        let mut fixture = Fixture::new();
        let _kubelet = FakeKubelet::start(fixture.tmp.path()).await;
        fixture
            .supervisor
            .create_all(&fixture.config)
            .await
            .expect("create all");

        let serial = fixture.supervisor.get("example.com/serial").expect("serial");
        let channel = transport::connect_unix(serial.socket_path(), Duration::from_secs(2))
            .await
            .expect("connect");
        let mut client = DevicePluginClient::new(channel);
        let mut stream = client
            .list_and_watch(Empty {})
            .await
            .expect("watch")
            .into_inner();
        let initial = stream.message().await.expect("message").expect("initial");
        assert_eq!(initial.devices.len(), 1);

        fixture.matcher.unplug(&DeviceHandle::new(SERIAL));
        assert_eq!(fixture.supervisor.refresh_all(), 1);
        let update = stream.message().await.expect("message").expect("update");
        assert!(update.devices.is_empty());

        let status = client
            .allocate(AllocateRequest {
                container_requests: vec![ContainerAllocateRequest {
                    devices_ids: vec![SERIAL.to_string()],
                }],
            })
            .await
            .expect_err("withdrawn device");
        assert_eq!(status.code(), Code::NotFound);

        fixture.supervisor.stop_all().await;
        let end = stream.message().await;
        assert!(!matches!(end, Ok(Some(_))));
    }

    #[test(tokio::test)]
    async fn stop_all_then_create_all_reuses_socket_paths() {
        let mut fixture = Fixture::new();
        let kubelet = FakeKubelet::start(fixture.tmp.path()).await;
        fixture
            .supervisor
            .create_all(&fixture.config)
            .await
            .expect("create all");
        let before: Vec<_> = fixture
            .supervisor
            .instances()
            .map(|server| server.socket_path().to_path_buf())
            .collect();

        fixture.supervisor.stop_all().await;
        fixture
            .supervisor
            .create_all(&fixture.config)
            .await
            .expect("create all again");
        let after: Vec<_> = fixture
            .supervisor
            .instances()
            .map(|server| server.socket_path().to_path_buf())
            .collect();

        assert_eq!(before, after);
        assert!(after.iter().all(|path| path.exists()));
        assert_eq!(kubelet.requests().len(), 4);

        fixture.supervisor.stop_all().await;
    }
}
