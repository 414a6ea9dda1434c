// discovery/mod.rs
//! Finds the lamp and keeps the connection state in step with reachability.
//!
//! A single actor task owns the session state. Every network
//! call and timer runs in a spawned task that reports back to the actor
//! tagged with the epoch it was started under. Entering a state bumps the
//! epoch and aborts the previous state's tasks, so a stale timer or probe
//! result never touches the new state.

mod actor;
mod throttle;

use crate::config::Settings;
use crate::device::{DeviceApi, LiveFrame, Preset};
use crate::error::{AppError, DeviceError};
use crate::models::{ConnectionState, DragPhase, StatusView};
use crate::storage::AddressStore;
use crate::utils::normalize_host;
use actor::Actor;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub well_known_host: String,
    pub access_point_host: String,
    pub probe_timeout: Duration,
    pub access_point_timeout: Duration,
    pub request_timeout: Duration,
    pub setup_interval: Duration,
    pub sync_interval: Duration,
    pub color_throttle: Duration,
    pub transition: Option<u16>,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            well_known_host: "seazencity.local".to_string(),
            access_point_host: "4.3.2.1".to_string(),
            probe_timeout: Duration::from_secs(3),
            access_point_timeout: Duration::from_millis(2500),
            request_timeout: Duration::from_secs(3),
            setup_interval: Duration::from_secs(4),
            sync_interval: Duration::from_secs(5),
            color_throttle: Duration::from_millis(150),
            transition: None,
        }
    }
}

impl DiscoveryOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            well_known_host: settings.lamp.well_known_host.clone(),
            access_point_host: settings.lamp.access_point_host.clone(),
            probe_timeout: settings.lamp.probe_timeout(),
            access_point_timeout: settings.lamp.access_point_timeout(),
            request_timeout: settings.lamp.request_timeout(),
            setup_interval: settings.discovery.setup_interval(),
            sync_interval: settings.discovery.sync_interval(),
            color_throttle: settings.discovery.color_throttle(),
            transition: settings.lamp.transition,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum LampCommand {
    SetPower(bool),
    TogglePower,
    Brightness(u8, DragPhase),
    Color([u8; 3], DragPhase),
    ApplyPreset(u16),
}

#[derive(Debug)]
pub(crate) enum Command {
    Lamp(LampCommand),
    UseAddress(String),
    Retry,
    BeginSetup,
    Disconnect,
}

pub(crate) struct Request {
    command: Command,
    reply: oneshot::Sender<Result<(), AppError>>,
}

/// Cloneable handle to the connection actor.
#[derive(Clone)]
pub struct Controller {
    requests: mpsc::Sender<Request>,
    status: watch::Receiver<StatusView>,
    device: Arc<dyn DeviceApi>,
    request_timeout: Duration,
}

impl Controller {
    /// Starts the actor; it begins in Detecting right away.
    pub fn spawn(
        device: Arc<dyn DeviceApi>,
        store: Arc<dyn AddressStore>,
        options: DiscoveryOptions,
    ) -> Self {
        let (requests, requests_rx) = mpsc::channel(64);
        let (events, events_rx) = mpsc::unbounded_channel();
        let request_timeout = options.request_timeout;
        let actor = Actor::new(device.clone(), store, options, events);
        let status = actor.subscribe();
        tokio::spawn(actor.run(requests_rx, events_rx));

        Self {
            requests,
            status,
            device,
            request_timeout,
        }
    }

    pub fn status(&self) -> StatusView {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusView> {
        self.status.clone()
    }

    pub async fn set_power(&self, on: bool) -> Result<(), AppError> {
        self.send(Command::Lamp(LampCommand::SetPower(on))).await
    }

    pub async fn toggle_power(&self) -> Result<(), AppError> {
        self.send(Command::Lamp(LampCommand::TogglePower)).await
    }

    pub async fn set_brightness(&self, level: u8, phase: DragPhase) -> Result<(), AppError> {
        self.send(Command::Lamp(LampCommand::Brightness(level, phase)))
            .await
    }

    pub async fn set_color(&self, rgb: [u8; 3], phase: DragPhase) -> Result<(), AppError> {
        self.send(Command::Lamp(LampCommand::Color(rgb, phase))).await
    }

    pub async fn apply_preset(&self, id: u16) -> Result<(), AppError> {
        self.send(Command::Lamp(LampCommand::ApplyPreset(id))).await
    }

    pub async fn disconnect(&self) -> Result<(), AppError> {
        self.send(Command::Disconnect).await
    }

    pub async fn retry(&self) -> Result<(), AppError> {
        self.send(Command::Retry).await
    }

    pub async fn begin_setup(&self) -> Result<(), AppError> {
        self.send(Command::BeginSetup).await
    }

    /// Probes a user-supplied address and connects to it. Blank input never reaches the network.
    pub async fn use_address(&self, host: &str) -> Result<(), AppError> {
        let host = normalize_host(host);
        if host.is_empty() {
            return Err(AppError::Validation("lamp address is empty".into()));
        }
        self.send(Command::UseAddress(host)).await
    }

    pub async fn presets(&self) -> Result<Vec<Preset>, AppError> {
        let host = self.connected_host()?;
        Ok(self.bounded(self.device.presets(&host)).await?)
    }

    pub async fn live(&self) -> Result<LiveFrame, AppError> {
        let host = self.connected_host()?;
        Ok(self.bounded(self.device.live(&host)).await?)
    }

    fn connected_host(&self) -> Result<String, AppError> {
        match &self.status.borrow().state {
            ConnectionState::Connected { host, .. } => Ok(host.clone()),
            _ => Err(AppError::NotConnected),
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, DeviceError>>,
    ) -> Result<T, DeviceError> {
        with_deadline(self.request_timeout, call).await
    }

    async fn send(&self, command: Command) -> Result<(), AppError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request { command, reply })
            .await
            .map_err(|_| AppError::ControllerStopped)?;
        rx.await.map_err(|_| AppError::ControllerStopped)?
    }
}

/// Caps any device call, whatever timeout the client itself applies.
pub(crate) async fn with_deadline<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, DeviceError>>,
) -> Result<T, DeviceError> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(DeviceError::Timeout))
}
