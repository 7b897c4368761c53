//! Device plugin servers and their lifecycle.

pub mod allocation;
pub mod api;
pub mod inventory;
pub mod reconciler;
pub mod server;
pub mod supervisor;
pub mod transport;

use core::error::Error;
use std::time::Duration;

use derive_more::Display;

pub use inventory::DeviceRecord;
pub use inventory::Health;
pub use inventory::Inventory;
pub use inventory::InventoryHub;
pub use reconciler::InventoryReconciler;
pub use server::ResourcePluginServer;
pub use server::ServerState;
pub use supervisor::PluginSupervisor;
pub use supervisor::SupervisorSettings;

/// Errors raised while starting, registering or stopping plugin servers.
#[derive(Debug, Display)]
pub enum PluginError {
    #[display("failed to prepare socket directory {path}")]
    SocketDir { path: String },
    #[display("failed to bind plugin socket {path}")]
    Bind { path: String },
    #[display("plugin socket {path} did not accept connections within {timeout:?}")]
    DialTimeout { path: String, timeout: Duration },
    #[display("failed to register {resource} with kubelet at {kubelet_socket}")]
    Registration {
        resource: String,
        kubelet_socket: String,
    },
    #[display("plugin server for {resource} has already been stopped")]
    Stopped { resource: String },
    #[display("plugin server for {resource} is not serving")]
    NotServing { resource: String },
    #[display("failed to remove plugin socket {path}")]
    Cleanup { path: String },
    #[display("failed to enumerate devices for {resource}")]
    Enumeration { resource: String },
    #[display("failed to load plugin configuration")]
    Config,
    #[display("failed to set up {name} event source")]
    EventSource { name: String },
}

impl Error for PluginError {}
