//! External event sources feeding the control loop, one typed channel each.

use std::io;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use futures::StreamExt;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::device::DeviceError;
use crate::device::DeviceEvent;
use crate::device::DeviceEventStream;
use crate::device::DeviceMatcher;
use crate::plugin::PluginError;

/// Signals the daemon reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ProcessSignal {
    #[display("SIGHUP")]
    Hangup,
    #[display("SIGINT")]
    Interrupt,
    #[display("SIGTERM")]
    Terminate,
    #[display("SIGQUIT")]
    Quit,
}

#[derive(Debug)]
pub enum WatchNotice {
    /// The kubelet socket was (re)created.
    SocketCreated,
    Error(String),
}

#[derive(Debug)]
pub enum DeviceNotice {
    Event(DeviceEvent),
    Error(Report<DeviceError>),
}

/// Sending halves of the event channels.
#[derive(Clone)]
pub struct EventSenders {
    pub kubelet: mpsc::UnboundedSender<WatchNotice>,
    pub signals: mpsc::UnboundedSender<ProcessSignal>,
    pub devices: mpsc::UnboundedSender<DeviceNotice>,
}

/// Receiving halves plus whatever keeps the producers alive.
pub struct EventSources {
    pub(super) kubelet: mpsc::UnboundedReceiver<WatchNotice>,
    pub(super) signals: mpsc::UnboundedReceiver<ProcessSignal>,
    pub(super) devices: mpsc::UnboundedReceiver<DeviceNotice>,
    _watcher: Option<RecommendedWatcher>,
    tasks: Vec<JoinHandle<()>>,
}

impl EventSources {
    /// Bare channels with nothing attached.
    pub fn channels() -> (Self, EventSenders) {
        let (kubelet_tx, kubelet) = mpsc::unbounded_channel();
        let (signals_tx, signals) = mpsc::unbounded_channel();
        let (devices_tx, devices) = mpsc::unbounded_channel();
        (
            Self {
                kubelet,
                signals,
                devices,
                _watcher: None,
                tasks: Vec::new(),
            },
            EventSenders {
                kubelet: kubelet_tx,
                signals: signals_tx,
                devices: devices_tx,
            },
        )
    }

    /// Watch the kubelet socket, the process signals and the matcher's hotplug events.
    pub fn spawn(
        kubelet_socket: &Path,
        matcher: &dyn DeviceMatcher,
    ) -> Result<Self, Report<PluginError>> {
        let (mut sources, senders) = Self::channels();

        info!("Starting FS watcher");
        let watcher = watch_kubelet_socket(kubelet_socket, senders.kubelet).change_context(
            PluginError::EventSource {
                name: "kubelet socket".to_string(),
            },
        )?;
        sources._watcher = Some(watcher);

        info!("Starting OS watcher");
        let signals = forward_signals(senders.signals).change_context(PluginError::EventSource {
            name: "signal".to_string(),
        })?;
        sources.tasks.push(signals);

        info!("Starting udev watcher");
        let events = matcher.events().change_context(PluginError::EventSource {
            name: "device".to_string(),
        })?;
        sources.tasks.push(forward_device_events(events, senders.devices));

        Ok(sources)
    }
}

impl Drop for EventSources {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Report creations of `kubelet_socket`. Events stop once the watcher is dropped.
pub fn watch_kubelet_socket(
    kubelet_socket: &Path,
    tx: mpsc::UnboundedSender<WatchNotice>,
) -> Result<RecommendedWatcher, Report<notify::Error>> {
    let socket_name = kubelet_socket.file_name().map(ToOwned::to_owned);
    let dir = kubelet_socket
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            let notice = match res {
                Ok(event) => {
                    debug!("Filesystem event: {:?}", event);
                    let created = matches!(event.kind, EventKind::Create(_))
                        && event
                            .paths
                            .iter()
                            .any(|path| path.file_name() == socket_name.as_deref());
                    if !created {
                        return;
                    }
                    WatchNotice::SocketCreated
                }
                Err(e) => {
                    error!("Filesystem watch error: {:?}", e);
                    WatchNotice::Error(e.to_string())
                }
            };
            // receiver gone means the loop is shutting down
            let _ = tx.send(notice);
        },
        Config::default(),
    )?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .attach_printable_lazy(|| format!("watching {}", dir.display()))?;
    Ok(watcher)
}

/// Forward SIGHUP, SIGINT, SIGTERM and SIGQUIT.
pub fn forward_signals(tx: mpsc::UnboundedSender<ProcessSignal>) -> io::Result<JoinHandle<()>> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    Ok(tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                Some(()) = hangup.recv() => ProcessSignal::Hangup,
                Some(()) = interrupt.recv() => ProcessSignal::Interrupt,
                Some(()) = terminate.recv() => ProcessSignal::Terminate,
                Some(()) = quit.recv() => ProcessSignal::Quit,
                else => break,
            };
            if tx.send(received).is_err() {
                break;
            }
        }
    }))
}

/// Forward a matcher event stream until it ends. The channel closes with it.
pub fn forward_device_events(
    mut events: DeviceEventStream,
    tx: mpsc::UnboundedSender<DeviceNotice>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = events.next().await {
            let notice = match item {
                Ok(event) => DeviceNotice::Event(event),
                Err(e) => DeviceNotice::Error(e),
            };
            if tx.send(notice).is_err() {
                return;
            }
        }
        debug!("device event stream ended");
    })
}
