use crate::config::Settings;
use crate::device::{DeviceApi, DeviceState};
use crate::discovery::Controller;
use crate::shell::ShellWorker;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct LampSnapshot {
    pub power: bool,
    pub brightness: u8,
    pub effect: u16,
    #[schema(value_type = Vec<u8>)]
    pub color: [u8; 3],
    pub preset: Option<u16>,
}

impl Default for LampSnapshot {
    fn default() -> Self {
        Self {
            power: false,
            brightness: 128,
            effect: 0,
            color: [255, 255, 255],
            preset: None,
        }
    }
}

impl LampSnapshot {
    /// Overwrites fields with what the lamp reported; segment fields it left out are kept.
    pub fn apply(&mut self, state: &DeviceState) {
        self.power = state.on;
        self.brightness = state.bri;
        self.preset = state.preset();
        if let Some(fx) = state.effect() {
            self.effect = fx;
        }
        if let Some(color) = state.primary_color() {
            self.color = color;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionState {
    Detecting,
    AwaitingSetup {
        attempts: u32,
        /// The lamp's own setup network answered on the last round.
        access_point: bool,
    },
    Recovering {
        retrying: bool,
        /// Manual retries that came back empty.
        retries: u32,
    },
    Connected {
        host: String,
        name: String,
    },
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Detecting => "detecting",
            ConnectionState::AwaitingSetup { .. } => "awaiting_setup",
            ConnectionState::Recovering { .. } => "recovering",
            ConnectionState::Connected { .. } => "connected",
        }
    }

    pub fn host(&self) -> Option<&str> {
        match self {
            ConnectionState::Connected { host, .. } => Some(host),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StatusView {
    pub state: ConnectionState,
    pub snapshot: LampSnapshot,
    #[schema(value_type = Option<String>)]
    pub last_sync: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DragPhase {
    Move,
    #[default]
    Release,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    StatusUpdate(StatusView),
    SetPower { power: bool },
    TogglePower,
    SetBrightness {
        brightness: u8,
        #[serde(default)]
        phase: DragPhase,
    },
    SetColor {
        color: [u8; 3],
        #[serde(default)]
        phase: DragPhase,
    },
    ApplyPreset { preset: u16 },
    UseAddress { host: String },
    Retry,
    BeginSetup,
    Disconnect,
    Error { message: String, code: u16 },
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct AddressRequest {
    #[validate(length(min = 1, max = 253))]
    pub host: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PowerRequest {
    /// Omit to toggle.
    pub on: Option<bool>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BrightnessRequest {
    pub level: u8,
    #[serde(default)]
    pub phase: DragPhase,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ColorRequest {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    #[serde(default)]
    pub phase: DragPhase,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct PresetRequest {
    #[validate(range(min = 1, max = 250))]
    pub id: u16,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct WifiRequest {
    #[validate(length(min = 1, max = 32))]
    pub ssid: String,
    #[validate(length(max = 64))]
    #[serde(default)]
    pub psk: String,
}

pub struct AppState {
    pub controller: Controller,
    pub device: Arc<dyn DeviceApi>,
    pub shell: Arc<ShellWorker>,
    pub clients: DashMap<Uuid, DateTime<Utc>>,
    /// One permit per WebSocket client, taken before the upgrade.
    pub client_slots: Arc<Semaphore>,
    pub settings: Settings,
}

impl AppState {
    pub fn new(
        controller: Controller,
        device: Arc<dyn DeviceApi>,
        shell: Arc<ShellWorker>,
        settings: Settings,
    ) -> Self {
        Self {
            controller,
            device,
            shell,
            clients: DashMap::new(),
            client_slots: Arc::new(Semaphore::new(settings.server.max_connections as usize)),
            settings,
        }
    }
}
