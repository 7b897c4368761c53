use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use hostdevice_plugin::config::Cli;
use hostdevice_plugin::config::Commands;
use hostdevice_plugin::config::DaemonArgs;
use hostdevice_plugin::config::ListDevicesArgs;
use hostdevice_plugin::control_loop::ControlLoop;
use hostdevice_plugin::control_loop::DeviceEventPolicy;
use hostdevice_plugin::control_loop::EventSources;
use hostdevice_plugin::device::DeviceInfo;
use hostdevice_plugin::device::DeviceMatcher;
use hostdevice_plugin::plugin::PluginSupervisor;
use hostdevice_plugin::plugin::SupervisorSettings;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::ListDevices(list_args) => run_list_devices(list_args).await,
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = utils::logging::init();

    tracing::info!("Starting hostdevice plugin {}", &**version::VERSION);

    let matcher: Arc<dyn DeviceMatcher> = Arc::new(daemon_args.matcher.build());
    let kubelet_socket = daemon_args.kubelet_socket();

    let sources = EventSources::spawn(&kubelet_socket, matcher.as_ref())
        .map_err(|e| anyhow::anyhow!("failed to start event sources: {e:?}"))?;

    let supervisor = PluginSupervisor::new(
        matcher,
        SupervisorSettings {
            device_plugin_dir: daemon_args.device_plugin_path.clone(),
            kubelet_socket,
            dial_timeout: daemon_args.dial_timeout,
        },
    );
    let policy = if daemon_args.restart_on_device_event {
        DeviceEventPolicy::Restart
    } else {
        DeviceEventPolicy::Incremental
    };

    let mut control_loop = ControlLoop::new(
        daemon_args.config.clone(),
        supervisor,
        daemon_args.refresh_interval,
        policy,
    );
    control_loop
        .run(sources)
        .await
        .map_err(|e| anyhow::anyhow!("device plugin daemon failed: {e:?}"))?;

    tracing::info!("done");
    Ok(())
}

async fn run_list_devices(list_args: ListDevicesArgs) -> Result<()> {
    let _guard = utils::logging::init();

    let matcher = list_args.matcher.build();
    let filter = list_args.filter();

    let devices = matcher
        .enumerate(&filter)
        .map_err(|e| anyhow::anyhow!("failed to list udev devices: {e:?}"))?;
    for device in &devices {
        print_device(&matcher, device);
    }
    if !list_args.watch {
        return Ok(());
    }

    let mut events = matcher
        .events()
        .map_err(|e| anyhow::anyhow!("failed to create udev monitor: {e:?}"))?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            item = events.next() => match item {
                Some(Ok(event)) if filter.matches(&event.device.properties) => {
                    println!("{} {}", event.action, event.device.handle);
                    if event.action.is_presence() {
                        print_device(&matcher, &event.device);
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => tracing::error!("received error from udev watch: {e:?}"),
                None => break,
            }
        }
    }
    Ok(())
}

fn print_device(matcher: &dyn DeviceMatcher, device: &DeviceInfo) {
    println!("{}", device.handle);
    match matcher.resolve(&device.handle) {
        Ok(host_path) => println!("  host path: {}", host_path.display()),
        Err(e) => println!("  host path: unavailable ({})", e.current_context()),
    }
    for (key, value) in &device.properties {
        println!("  {key}={value}");
    }
}
