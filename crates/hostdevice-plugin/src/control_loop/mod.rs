//! The daemon's single reactor.
//!
//! Kubelet restarts, signals, hotplug events and the refresh timer are all
//! handled here, one at a time, so the supervisor never sees concurrent
//! lifecycle changes.

pub mod sources;

use std::path::PathBuf;
use std::time::Duration;

use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

pub use sources::EventSenders;
pub use sources::EventSources;
pub use sources::ProcessSignal;

use crate::config::PluginConfig;
use crate::device::DeviceError;
use crate::device::DeviceEvent;
use crate::plugin::PluginError;
use crate::plugin::PluginSupervisor;
use sources::DeviceNotice;
use sources::WatchNotice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LoopState {
    Running,
    Restarting,
    Stopping,
}

/// What to do with a hotplug event for a configured resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceEventPolicy {
    /// Update the affected inventories in place.
    #[default]
    Incremental,
    /// Tear every plugin down and recreate it.
    Restart,
}

#[derive(Debug)]
pub enum LoopEvent {
    KubeletSocketCreated,
    WatchError(String),
    Signal(ProcessSignal),
    Device(DeviceEvent),
    DeviceStreamError(Report<DeviceError>),
    DeviceStreamEnded,
    RefreshTick,
}

pub struct ControlLoop {
    config_path: PathBuf,
    supervisor: PluginSupervisor,
    refresh_interval: Duration,
    device_policy: DeviceEventPolicy,
    state: LoopState,
}

impl ControlLoop {
    pub fn new(
        config_path: PathBuf,
        supervisor: PluginSupervisor,
        refresh_interval: Duration,
        device_policy: DeviceEventPolicy,
    ) -> Self {
        Self {
            config_path,
            supervisor,
            refresh_interval,
            device_policy,
            state: LoopState::Running,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn supervisor(&self) -> &PluginSupervisor {
        &self.supervisor
    }

    /// Create every plugin and react to events until asked to shut down.
    ///
    /// Failing to create the plugins, at startup or on restart, stops whatever
    /// was started and ends the loop with the error.
    pub async fn run(&mut self, mut sources: EventSources) -> Result<(), Report<PluginError>> {
        self.state = LoopState::Running;
        if let Err(e) = self.create_all().await {
            self.supervisor.stop_all().await;
            return Err(e);
        }

        let mut refresh =
            tokio::time::interval_at(Instant::now() + self.refresh_interval, self.refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut kubelet_open = true;
        let mut signals_open = true;
        let mut devices_open = true;

        while self.state != LoopState::Stopping {
            let event = tokio::select! {
                notice = sources.kubelet.recv(), if kubelet_open => match notice {
                    Some(WatchNotice::SocketCreated) => LoopEvent::KubeletSocketCreated,
                    Some(WatchNotice::Error(message)) => LoopEvent::WatchError(message),
                    None => {
                        warn!("kubelet socket watcher closed");
                        kubelet_open = false;
                        continue;
                    }
                },
                signal = sources.signals.recv(), if signals_open => match signal {
                    Some(signal) => LoopEvent::Signal(signal),
                    None => {
                        warn!("signal watcher closed");
                        signals_open = false;
                        continue;
                    }
                },
                notice = sources.devices.recv(), if devices_open => match notice {
                    Some(DeviceNotice::Event(event)) => LoopEvent::Device(event),
                    Some(DeviceNotice::Error(e)) => LoopEvent::DeviceStreamError(e),
                    None => {
                        devices_open = false;
                        LoopEvent::DeviceStreamEnded
                    }
                },
                _ = refresh.tick() => LoopEvent::RefreshTick,
            };

            if let Err(e) = self.handle(event).await {
                error!("failed to recreate device plugins: {e:?}");
                self.state = LoopState::Stopping;
                self.supervisor.stop_all().await;
                return Err(e);
            }
        }

        info!("shutting down device plugins");
        self.supervisor.stop_all().await;
        Ok(())
    }

    /// Handle one event. Only a failed restart is an error.
    pub async fn handle(&mut self, event: LoopEvent) -> Result<(), Report<PluginError>> {
        match event {
            LoopEvent::KubeletSocketCreated => {
                info!("kubelet socket created, restarting");
                self.restart().await?;
            }
            LoopEvent::WatchError(message) => {
                warn!("kubelet socket watch error: {message}");
            }
            LoopEvent::Signal(ProcessSignal::Hangup) => {
                info!("Received SIGHUP, restarting");
                self.restart().await?;
            }
            LoopEvent::Signal(signal) => {
                info!("Received signal {signal}, shutting down");
                self.state = LoopState::Stopping;
            }
            LoopEvent::Device(event) => self.handle_device_event(event).await?,
            LoopEvent::DeviceStreamError(e) => {
                error!("received error from udev watch: {e:?}");
            }
            LoopEvent::DeviceStreamEnded => {
                warn!("device event stream ended, relying on periodic refresh");
            }
            LoopEvent::RefreshTick => {
                let changed = self.supervisor.refresh_all();
                debug!(changed, "periodic refresh done");
            }
        }
        Ok(())
    }

    async fn handle_device_event(&mut self, event: DeviceEvent) -> Result<(), Report<PluginError>> {
        debug!(
            action = %event.action,
            device = %event.device.handle,
            "udev update"
        );
        match self.device_policy {
            DeviceEventPolicy::Incremental => {
                self.supervisor.apply_event(&event);
            }
            DeviceEventPolicy::Restart => {
                let relevant = self
                    .supervisor
                    .instances()
                    .any(|server| server.resource().filter.matches(&event.device.properties));
                if relevant {
                    info!(
                        action = %event.action,
                        device = %event.device.handle,
                        "device event for a configured resource, restarting"
                    );
                    self.restart().await?;
                }
            }
        }
        Ok(())
    }

    async fn restart(&mut self) -> Result<(), Report<PluginError>> {
        self.state = LoopState::Restarting;
        self.supervisor.stop_all().await;
        self.create_all().await?;
        self.state = LoopState::Running;
        info!("restarted");
        Ok(())
    }

    async fn create_all(&mut self) -> Result<(), Report<PluginError>> {
        let config = PluginConfig::load(&self.config_path).change_context(PluginError::Config)?;
        self.supervisor.create_all(&config).await
    }
}
