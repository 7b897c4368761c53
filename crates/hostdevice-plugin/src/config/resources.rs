//! Resource configuration document.
//!
//! ```json
//! {
//!   "socketPrefix": "hostdevice",
//!   "devices": {
//!     "example.com/serial": {
//!       "containerPath": "/dev/ttyUSB0",
//!       "permissions": "rw",
//!       "matchProperties": { "SUBSYSTEM": "tty", "ID_SERIAL": "ABC123" }
//!     }
//!   }
//! }
//! ```

use core::error::Error;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;

use crate::device::MatchFilter;

pub const DEFAULT_CONFIG_PATH: &str = "/k8s-hostdevice-plugin/config.json";

/// Errors raised while loading the resource configuration.
#[derive(Debug, Display)]
pub enum ConfigError {
    #[display("failed to read config file {path}")]
    Read { path: String },
    #[display("failed to parse config json")]
    Parse,
    #[display("invalid config: {message}")]
    Invalid { message: String },
}

impl Error for ConfigError {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    /// Subdirectory of the device plugin directory that holds the plugin sockets.
    #[serde(default)]
    pub socket_prefix: String,
    /// Resource name to device options.
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub container_path: String,
    /// Cgroup device permissions, any of `r`, `w`, `m`.
    #[serde(default)]
    pub permissions: String,
    #[serde(default)]
    pub match_properties: MatchFilter,
}

/// One advertised resource class, fixed for the lifetime of its plugin server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceConfig {
    pub name: String,
    pub container_path: String,
    pub permissions: String,
    pub filter: MatchFilter,
}

impl ResourceConfig {
    /// Socket file name: the resource name with `/` replaced by `-`, plus `.sock`.
    pub fn socket_file_name(&self) -> String {
        socket_file_name(&self.name)
    }
}

fn socket_file_name(resource_name: &str) -> String {
    format!("{}.sock", resource_name.replace('/', "-"))
}

impl PluginConfig {
    pub fn load(path: &Path) -> Result<Self, Report<ConfigError>> {
        info!("Reading {}", path.display());
        let raw = fs::read_to_string(path).change_context_lazy(|| ConfigError::Read {
            path: path.display().to_string(),
        })?;
        let config = Self::from_json(&raw)
            .attach_printable_lazy(|| format!("config file {}", path.display()))?;
        info!(
            socket_prefix = %config.socket_prefix,
            resources = ?config.devices.keys().collect::<Vec<_>>(),
            "loaded config"
        );
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, Report<ConfigError>> {
        let config: Self = serde_json::from_str(raw).change_context(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Report<ConfigError>> {
        let invalid = |message: String| Report::new(ConfigError::Invalid { message });

        let prefix = Path::new(&self.socket_prefix);
        if prefix.is_absolute()
            || prefix
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(invalid(format!(
                "socketPrefix {:?} must be a relative path without '..'",
                self.socket_prefix
            )));
        }

        let mut sockets: HashMap<String, &str> = HashMap::new();
        for (name, device) in &self.devices {
            if name.trim().is_empty() {
                return Err(invalid("resource name cannot be empty".to_string()));
            }
            if !Path::new(&device.container_path).is_absolute() {
                return Err(invalid(format!(
                    "containerPath {:?} of {name} must be absolute",
                    device.container_path
                )));
            }
            let socket = socket_file_name(name);
            if let Some(other) = sockets.insert(socket.clone(), name) {
                return Err(invalid(format!(
                    "resources {other} and {name} both map to socket {socket}"
                )));
            }
        }
        Ok(())
    }

    /// Resources in name order.
    pub fn resources(&self) -> Vec<ResourceConfig> {
        self.devices
            .iter()
            .map(|(name, device)| ResourceConfig {
                name: name.clone(),
                container_path: device.container_path.clone(),
                permissions: device.permissions.clone(),
                filter: device.match_properties.clone(),
            })
            .collect()
    }

    /// Directory holding the plugin sockets.
    pub fn socket_dir(&self, device_plugin_dir: &Path) -> PathBuf {
        device_plugin_dir.join(&self.socket_prefix)
    }

    /// Endpoint of `resource` as announced to the kubelet, relative to the
    /// device plugin directory.
    pub fn endpoint(&self, resource: &ResourceConfig) -> String {
        Path::new(&self.socket_prefix)
            .join(resource.socket_file_name())
            .to_string_lossy()
            .into_owned()
    }
}
