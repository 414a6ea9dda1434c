// device/mod.rs
mod wled;
#[cfg(test)]
pub mod mock;

pub use wled::WledClient;

use crate::error::DeviceError;
use serde::{Deserialize, Serialize, Serializer};
use std::time::Duration;
use utoipa::ToSchema;

/// The lamp's HTTP JSON API as the companion consumes it.
#[async_trait::async_trait]
pub trait DeviceApi: Send + Sync {
    /// `GET /json/info`, used as the reachability probe.
    async fn info(&self, host: &str, timeout: Duration) -> Result<DeviceInfo, DeviceError>;
    async fn state(&self, host: &str) -> Result<DeviceState, DeviceError>;
    async fn update(&self, host: &str, patch: &StatePatch) -> Result<(), DeviceError>;
    async fn presets(&self, host: &str) -> Result<Vec<Preset>, DeviceError>;
    async fn live(&self, host: &str) -> Result<LiveFrame, DeviceError>;
    /// `GET /json/net`. The first call starts a scan, later calls return its results.
    async fn networks(&self, host: &str) -> Result<Vec<WifiNetwork>, DeviceError>;
    /// `POST /json/cfg` with the home network credentials.
    async fn save_wifi(&self, host: &str, ssid: &str, psk: &str) -> Result<(), DeviceError>;
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    #[serde(default)]
    pub nw: Option<NetworkInfo>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct NetworkInfo {
    #[serde(default)]
    pub ins: Vec<NetworkInterface>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NetworkInterface {
    #[serde(default)]
    pub ip: Option<String>,
}

impl DeviceInfo {
    /// First non-empty station address the lamp reports, if any.
    pub fn ip(&self) -> Option<&str> {
        self.nw
            .as_ref()?
            .ins
            .iter()
            .filter_map(|i| i.ip.as_deref())
            .find(|ip| !ip.is_empty() && *ip != "0.0.0.0")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub on: bool,
    pub bri: u8,
    /// Active preset, `-1` when none.
    #[serde(default)]
    pub ps: Option<i32>,
    #[serde(default)]
    pub seg: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(default)]
    pub fx: Option<u16>,
    #[serde(default)]
    pub col: Vec<Vec<u8>>,
}

impl DeviceState {
    /// Primary colour of the first segment. RGBW entries are cut down to RGB.
    pub fn primary_color(&self) -> Option<[u8; 3]> {
        match self.seg.first()?.col.first()?.as_slice() {
            [r, g, b, ..] => Some([*r, *g, *b]),
            _ => None,
        }
    }

    pub fn effect(&self) -> Option<u16> {
        self.seg.first()?.fx
    }

    pub fn preset(&self) -> Option<u16> {
        self.ps.and_then(|ps| u16::try_from(ps).ok())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Power {
    On,
    Off,
    Toggle,
}

impl Serialize for Power {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Power::On => serializer.serialize_bool(true),
            Power::Off => serializer.serialize_bool(false),
            Power::Toggle => serializer.serialize_str("t"),
        }
    }
}

/// Body of `POST /json/state`. Unset fields are left out of the JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on: Option<Power>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bri: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seg: Option<Vec<SegmentPatch>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ps: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transition: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rb: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentPatch {
    pub col: Vec<[u8; 3]>,
}

impl StatePatch {
    pub fn power(on: bool) -> Self {
        Self {
            on: Some(if on { Power::On } else { Power::Off }),
            ..Self::default()
        }
    }

    pub fn toggle() -> Self {
        Self {
            on: Some(Power::Toggle),
            ..Self::default()
        }
    }

    pub fn brightness(level: u8) -> Self {
        Self {
            bri: Some(level),
            ..Self::default()
        }
    }

    pub fn color(rgb: [u8; 3]) -> Self {
        Self {
            seg: Some(vec![SegmentPatch { col: vec![rgb] }]),
            ..Self::default()
        }
    }

    pub fn preset(id: u16) -> Self {
        Self {
            ps: Some(id),
            ..Self::default()
        }
    }

    pub fn reboot() -> Self {
        Self {
            rb: Some(true),
            ..Self::default()
        }
    }

    pub fn with_transition(mut self, transition: Option<u16>) -> Self {
        self.transition = transition;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct Preset {
    pub id: u16,
    pub name: String,
}

/// `presets.json` maps ids to preset bodies. Slot `0` and unnamed slots are skipped.
pub fn parse_presets(raw: &serde_json::Value) -> Result<Vec<Preset>, DeviceError> {
    let map = raw
        .as_object()
        .ok_or_else(|| DeviceError::Malformed("presets.json is not an object".into()))?;

    let mut presets: Vec<Preset> = map
        .iter()
        .filter_map(|(key, body)| {
            let id = key.parse::<u16>().ok().filter(|id| *id > 0)?;
            let name = body.get("n")?.as_str()?.trim();
            (!name.is_empty()).then(|| Preset {
                id,
                name: name.to_string(),
            })
        })
        .collect();
    presets.sort_by_key(|p| p.id);
    Ok(presets)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct LiveFrame {
    #[serde(default)]
    pub leds: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct WifiNetwork {
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub rssi: i32,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct NetworkScan {
    #[serde(default)]
    pub networks: Vec<WifiNetwork>,
}
