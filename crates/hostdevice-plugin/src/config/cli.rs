use clap::{Parser, Subcommand};
use utils::version;

use crate::config::daemon::{DaemonArgs, ListDevicesArgs};

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the device plugin daemon
    Daemon(Box<DaemonArgs>),
    /// Print the devices a match filter selects, optionally following hotplug events
    #[command(name = "list-devices")]
    ListDevices(ListDevicesArgs),
}
