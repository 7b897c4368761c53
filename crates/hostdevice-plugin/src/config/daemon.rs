use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};

use crate::device::MatchFilter;
use crate::device::SysfsMatcher;

/// Kubelet's device plugin directory.
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins";
/// Name of the kubelet registration socket inside [`DEVICE_PLUGIN_PATH`].
pub const KUBELET_SOCKET_NAME: &str = "kubelet.sock";

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "HOSTDEVICE_PLUGIN_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        default_value = super::resources::DEFAULT_CONFIG_PATH,
        help = "Path of the resource configuration document, re-read on every restart"
    )]
    pub config: PathBuf,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_PATH",
        value_hint = clap::ValueHint::DirPath,
        default_value = DEVICE_PLUGIN_PATH,
        help = "Kubelet device plugin directory, watched for kubelet restarts"
    )]
    pub device_plugin_path: PathBuf,

    #[arg(
        long,
        env = "KUBELET_SOCKET",
        value_hint = clap::ValueHint::FilePath,
        help = "Kubelet registration socket (defaults to kubelet.sock in the device plugin directory)"
    )]
    pub kubelet_socket: Option<PathBuf>,

    #[arg(
        long,
        default_value = "5",
        value_parser = parse_seconds,
        help = "Seconds between full device refreshes, covering missed hotplug events"
    )]
    pub refresh_interval: Duration,

    #[arg(
        long,
        default_value = "10",
        value_parser = parse_seconds,
        help = "Seconds to wait for a plugin socket or the kubelet to accept connections"
    )]
    pub dial_timeout: Duration,

    #[arg(
        long,
        help = "Restart every plugin on any device event instead of updating inventories in place",
        default_value_t = false,
        env = "RESTART_ON_DEVICE_EVENT",
        action = clap::ArgAction::Set
    )]
    pub restart_on_device_event: bool,

    #[command(flatten)]
    pub matcher: MatcherArgs,
}

impl DaemonArgs {
    pub fn kubelet_socket(&self) -> PathBuf {
        self.kubelet_socket
            .clone()
            .unwrap_or_else(|| self.device_plugin_path.join(KUBELET_SOCKET_NAME))
    }
}

/// Where the sysfs matcher reads device state from.
#[derive(Args, Clone, Debug)]
pub struct MatcherArgs {
    #[arg(
        long,
        default_value = "/sys",
        value_hint = clap::ValueHint::DirPath,
        help = "sysfs mount point"
    )]
    pub sysfs_root: PathBuf,

    #[arg(
        long,
        default_value = "/run/udev/data",
        value_hint = clap::ValueHint::DirPath,
        help = "udev database directory"
    )]
    pub udev_data_dir: PathBuf,

    #[arg(
        long,
        default_value = "/dev",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory device nodes and links are created in"
    )]
    pub dev_root: PathBuf,
}

impl MatcherArgs {
    pub fn build(&self) -> SysfsMatcher {
        SysfsMatcher::new(&self.sysfs_root, &self.udev_data_dir, &self.dev_root)
    }
}

#[derive(Parser, Clone, Debug)]
pub struct ListDevicesArgs {
    #[arg(
        long = "match",
        value_name = "KEY=VALUE",
        value_parser = parse_property,
        help = "Only list devices with this udev property, may be repeated"
    )]
    pub properties: Vec<(String, String)>,

    #[arg(long, help = "Keep running and print device events as they arrive")]
    pub watch: bool,

    #[command(flatten)]
    pub matcher: MatcherArgs,
}

impl ListDevicesArgs {
    pub fn filter(&self) -> MatchFilter {
        self.properties.iter().cloned().collect()
    }
}

fn parse_seconds(s: &str) -> Result<Duration, String> {
    let secs: u64 = s
        .parse()
        .map_err(|e| format!("invalid number of seconds '{s}': {e}"))?;
    if secs == 0 {
        return Err("interval must be at least one second".to_string());
    }
    Ok(Duration::from_secs(secs))
}

fn parse_property(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}
