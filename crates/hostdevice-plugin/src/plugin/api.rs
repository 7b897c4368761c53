//! Generated kubelet protocol bindings.
#![allow(clippy::doc_markdown)]

/// Device plugin API served by every plugin and the kubelet's Registration service.
pub mod v1beta1 {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

/// Plugin watcher API the kubelet uses to report registration status back to a plugin.
pub mod pluginregistration {
    tonic::include_proto!("pluginregistration");
}

/// Device plugin API version this plugin implements.
pub const VERSION: &str = "v1beta1";
/// Plugin type announced through the plugin watcher API.
pub const DEVICE_PLUGIN_TYPE: &str = "DevicePlugin";
