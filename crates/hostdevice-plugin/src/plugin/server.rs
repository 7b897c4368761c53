//! One device plugin gRPC server per advertised resource.

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use futures::Stream;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::allocation;
use super::api;
use super::api::pluginregistration::registration_server::Registration as StatusRegistration;
use super::api::pluginregistration::registration_server::RegistrationServer as StatusRegistrationServer;
use super::api::pluginregistration::InfoRequest;
use super::api::pluginregistration::PluginInfo;
use super::api::pluginregistration::RegistrationStatus;
use super::api::pluginregistration::RegistrationStatusResponse;
use super::api::v1beta1::device_plugin_server::DevicePlugin;
use super::api::v1beta1::device_plugin_server::DevicePluginServer;
use super::api::v1beta1::registration_client::RegistrationClient;
use super::api::v1beta1::AllocateRequest;
use super::api::v1beta1::AllocateResponse;
use super::api::v1beta1::DevicePluginOptions;
use super::api::v1beta1::Empty;
use super::api::v1beta1::ListAndWatchResponse;
use super::api::v1beta1::PreStartContainerRequest;
use super::api::v1beta1::PreStartContainerResponse;
use super::api::v1beta1::PreferredAllocationRequest;
use super::api::v1beta1::PreferredAllocationResponse;
use super::api::v1beta1::RegisterRequest;
use super::transport;
use super::Inventory;
use super::InventoryHub;
use super::PluginError;
use crate::config::ResourceConfig;
use crate::device::DeviceMatcher;

/// How long `stop` waits for the serving task before aborting it.
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

const OPTIONS: DevicePluginOptions = DevicePluginOptions {
    pre_start_required: false,
    get_preferred_allocation_available: false,
};

/// Lifecycle of a plugin server. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ServerState {
    Created,
    Serving,
    Registered,
    Stopped,
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<Result<(), tonic::transport::Error>>,
}

/// Serves the device plugin API for one resource on its own Unix socket.
pub struct ResourcePluginServer {
    resource: Arc<ResourceConfig>,
    socket_path: PathBuf,
    endpoint: String,
    hub: InventoryHub,
    matcher: Arc<dyn DeviceMatcher>,
    registration_status: Arc<watch::Sender<Option<RegistrationStatus>>>,
    dial_timeout: Duration,
    state: ServerState,
    running: Option<Running>,
}

impl ResourcePluginServer {
    /// `endpoint` is the socket path relative to the kubelet's device plugin directory.
    pub fn new(
        resource: ResourceConfig,
        socket_path: PathBuf,
        endpoint: String,
        inventory: Inventory,
        matcher: Arc<dyn DeviceMatcher>,
        dial_timeout: Duration,
    ) -> Self {
        let (registration_status, _) = watch::channel(None);
        Self {
            resource: Arc::new(resource),
            socket_path,
            endpoint,
            hub: InventoryHub::new(inventory),
            matcher,
            registration_status: Arc::new(registration_status),
            dial_timeout,
            state: ServerState::Created,
            running: None,
        }
    }

    pub fn resource(&self) -> &ResourceConfig {
        &self.resource
    }

    pub fn name(&self) -> &str {
        &self.resource.name
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn hub(&self) -> &InventoryHub {
        &self.hub
    }

    /// Last status the kubelet reported through the plugin registration service.
    pub fn registration_status(&self) -> Option<RegistrationStatus> {
        self.registration_status.borrow().clone()
    }

    /// Bind the socket and serve until [`stop`](Self::stop).
    ///
    /// Returns once the server answers a gRPC call on its socket. A server that does not
    /// come up within the dial timeout is torn down again.
    pub async fn start(&mut self) -> Result<(), Report<PluginError>> {
        match self.state {
            ServerState::Created => {}
            ServerState::Stopped => {
                return Err(Report::new(PluginError::Stopped {
                    resource: self.resource.name.clone(),
                }))
            }
            ServerState::Serving | ServerState::Registered => return Ok(()),
        }
        info!(
            resource = %self.resource.name,
            "start device plugin server: {}",
            self.socket_path.display()
        );

        let bind_error = || PluginError::Bind {
            path: self.socket_path.display().to_string(),
        };
        remove_socket(&self.socket_path).change_context_lazy(bind_error)?;
        let listener = UnixListener::bind(&self.socket_path).change_context_lazy(bind_error)?;

        let token = CancellationToken::new();
        let device_plugin = DevicePluginServer::new(DevicePluginService {
            resource: self.resource.clone(),
            hub: self.hub.clone(),
            matcher: self.matcher.clone(),
            token: token.clone(),
        });
        let status = StatusRegistrationServer::new(RegistrationStatusService {
            name: self.resource.name.clone(),
            endpoint: self.endpoint.clone(),
            status: self.registration_status.clone(),
        });

        let shutdown = token.clone();
        let resource = self.resource.name.clone();
        let handle = tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(device_plugin)
                .add_service(status)
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    shutdown.cancelled().await;
                    info!(resource = %resource, "shutting down gRPC server");
                })
                .await
        });
        self.running = Some(Running { token, handle });

        if let Err(e) = transport::wait_until_serving(&self.socket_path, self.dial_timeout).await {
            error!(
                resource = %self.resource.name,
                "plugin server did not come up: {e}"
            );
            let report = Report::new(e).change_context(PluginError::DialTimeout {
                path: self.socket_path.display().to_string(),
                timeout: self.dial_timeout,
            });
            if let Err(stop_error) = self.stop().await {
                return Err(report.attach_printable(format!("{stop_error:?}")));
            }
            return Err(report);
        }

        self.state = ServerState::Serving;
        info!(resource = %self.resource.name, "gRPC server is serving");
        Ok(())
    }

    /// Announce this plugin to the kubelet's registration socket.
    pub async fn register(&mut self, kubelet_socket: &Path) -> Result<(), Report<PluginError>> {
        match self.state {
            ServerState::Serving | ServerState::Registered => {}
            ServerState::Stopped => {
                return Err(Report::new(PluginError::Stopped {
                    resource: self.resource.name.clone(),
                }))
            }
            ServerState::Created => {
                return Err(Report::new(PluginError::NotServing {
                    resource: self.resource.name.clone(),
                }))
            }
        }
        info!(
            resource = %self.resource.name,
            "registering device plugin with kubelet: {}",
            kubelet_socket.display()
        );

        let registration_error = || PluginError::Registration {
            resource: self.resource.name.clone(),
            kubelet_socket: kubelet_socket.display().to_string(),
        };
        let channel = transport::connect_unix(kubelet_socket, self.dial_timeout)
            .await
            .change_context_lazy(registration_error)?;
        let mut client = RegistrationClient::new(channel);

        let request = RegisterRequest {
            version: api::VERSION.to_string(),
            endpoint: self.endpoint.clone(),
            resource_name: self.resource.name.clone(),
            options: Some(OPTIONS),
        };
        client
            .register(Request::new(request))
            .await
            .change_context_lazy(registration_error)?;

        self.state = ServerState::Registered;
        info!(
            resource = %self.resource.name,
            "successfully registered device plugin with kubelet"
        );
        Ok(())
    }

    /// Stop serving, end every watch stream and remove the socket.
    ///
    /// Safe to call more than once and before [`start`](Self::start).
    pub async fn stop(&mut self) -> Result<(), Report<PluginError>> {
        self.hub.close();

        if let Some(Running { token, mut handle }) = self.running.take() {
            token.cancel();
            match tokio::time::timeout(STOP_GRACE_PERIOD, &mut handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!(resource = %self.resource.name, "gRPC server failed: {e}"),
                Ok(Err(e)) => warn!(resource = %self.resource.name, "gRPC server task failed: {e}"),
                Err(_) => {
                    warn!(
                        resource = %self.resource.name,
                        "gRPC server did not stop within {STOP_GRACE_PERIOD:?}, aborting"
                    );
                    handle.abort();
                }
            }
        }

        if self.state != ServerState::Stopped {
            debug!(resource = %self.resource.name, from = %self.state, "plugin server stopped");
        }
        self.state = ServerState::Stopped;

        remove_socket(&self.socket_path).change_context_lazy(|| PluginError::Cleanup {
            path: self.socket_path.display().to_string(),
        })
    }
}

impl Drop for ResourcePluginServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.token.cancel();
        }
    }
}

fn remove_socket(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn to_response(inventory: &Inventory) -> ListAndWatchResponse {
    ListAndWatchResponse {
        devices: inventory
            .records()
            .map(|record| api::v1beta1::Device {
                id: record.identity.to_string(),
                health: record.health.as_str().to_string(),
                topology: None,
            })
            .collect(),
    }
}

/// The kubelet-facing device plugin API of one resource.
struct DevicePluginService {
    resource: Arc<ResourceConfig>,
    hub: InventoryHub,
    matcher: Arc<dyn DeviceMatcher>,
    token: CancellationToken,
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");
        Ok(Response::new(OPTIONS))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        let mut subscription = self.hub.subscribe();
        let subscription_id = subscription.id();
        info!(
            resource = %self.resource.name,
            subscription = subscription_id,
            "starting to watch device list"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.token.clone();
        let resource = self.resource.name.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!(resource = %resource, subscription = subscription_id, "server stopping");
                        break;
                    }
                    _ = tx.closed() => {
                        debug!(resource = %resource, subscription = subscription_id, "watcher disconnected");
                        break;
                    }
                    snapshot = subscription.next() => {
                        let Some(inventory) = snapshot else {
                            break;
                        };
                        debug!(
                            resource = %resource,
                            subscription = subscription_id,
                            devices = inventory.len(),
                            "sending device list"
                        );
                        if tx.send(Ok(to_response(&inventory))).is_err() {
                            break;
                        }
                    }
                }
            }
            info!(resource = %resource, subscription = subscription_id, "device watch task stopped");
        });

        Ok(Response::new(Box::pin(UnboundedReceiverStream::new(rx))))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        debug!("getting preferred device allocation: {:?}", request.get_ref());
        Ok(Response::new(PreferredAllocationResponse {
            container_responses: vec![],
        }))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let request = request.into_inner();
        info!(
            resource = %self.resource.name,
            "allocating devices to containers: {:?}",
            request
                .container_requests
                .iter()
                .map(|container| &container.devices_ids)
                .collect::<Vec<_>>()
        );

        let inventory = self.hub.snapshot();
        let response =
            allocation::allocate(&self.resource, &inventory, self.matcher.as_ref(), &request)
                .map_err(|e| {
                    warn!(resource = %self.resource.name, "rejected allocation: {e}");
                    Status::from(e)
                })?;
        Ok(Response::new(response))
    }

    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        debug!("pre-start container: {:?}", request.get_ref());
        Ok(Response::new(PreStartContainerResponse {}))
    }
}

/// Receives registration results from the kubelet's plugin watcher.
struct RegistrationStatusService {
    name: String,
    endpoint: String,
    status: Arc<watch::Sender<Option<RegistrationStatus>>>,
}

#[tonic::async_trait]
impl StatusRegistration for RegistrationStatusService {
    async fn get_info(&self, _request: Request<InfoRequest>) -> TonicResult<Response<PluginInfo>> {
        Ok(Response::new(PluginInfo {
            r#type: api::DEVICE_PLUGIN_TYPE.to_string(),
            name: self.name.clone(),
            endpoint: self.endpoint.clone(),
            supported_versions: vec![api::VERSION.to_string()],
        }))
    }

    async fn notify_registration_status(
        &self,
        request: Request<RegistrationStatus>,
    ) -> TonicResult<Response<RegistrationStatusResponse>> {
        let status = request.into_inner();
        if status.plugin_registered {
            info!(resource = %self.name, "kubelet reports plugin registered");
        } else {
            warn!(
                resource = %self.name,
                "kubelet failed to register plugin: {}",
                status.error
            );
        }
        self.status.send_replace(Some(status));
        Ok(Response::new(RegistrationStatusResponse {}))
    }
}
