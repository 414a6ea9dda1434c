// device/mock.rs
use super::{
    DeviceApi, DeviceInfo, DeviceState, LiveFrame, Power, Preset, Segment, StatePatch, WifiNetwork,
    parse_presets,
};
use crate::error::DeviceError;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reach {
    Online,
    /// Hangs until the caller's timeout elapses.
    Timeout,
    Refused,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub at: Instant,
    pub host: String,
    pub endpoint: &'static str,
}

/// In-memory lamp that echoes every patch into its state.
pub struct MockDevice {
    name: String,
    hosts: Mutex<HashMap<String, Reach>>,
    state: Mutex<DeviceState>,
    /// Raw `presets.json` body.
    presets: Mutex<serde_json::Value>,
    slow_colors: Mutex<HashMap<[u8; 3], Duration>>,
    scans: Mutex<VecDeque<Vec<WifiNetwork>>>,
    calls: Mutex<Vec<Call>>,
    patches: Mutex<Vec<(String, StatePatch)>>,
    saved_wifi: Mutex<Option<(String, String)>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            name: "Sea Lamp".to_string(),
            hosts: Mutex::new(HashMap::new()),
            state: Mutex::new(DeviceState {
                on: false,
                bri: 128,
                ps: Some(-1),
                seg: vec![Segment {
                    fx: Some(0),
                    col: vec![vec![255, 160, 0]],
                }],
            }),
            presets: Mutex::new(serde_json::json!({})),
            slow_colors: Mutex::new(HashMap::new()),
            scans: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            patches: Mutex::new(Vec::new()),
            saved_wifi: Mutex::new(None),
        }
    }

    pub fn with_host(self, host: &str, reach: Reach) -> Self {
        self.set_reach(host, reach);
        self
    }

    pub fn set_reach(&self, host: &str, reach: Reach) {
        self.hosts.lock().unwrap().insert(host.to_string(), reach);
    }

    pub fn set_presets(&self, raw: serde_json::Value) {
        *self.presets.lock().unwrap() = raw;
    }

    /// Holds back any write of `rgb` for `delay` before it lands.
    pub fn delay_color(&self, rgb: [u8; 3], delay: Duration) {
        self.slow_colors.lock().unwrap().insert(rgb, delay);
    }

    /// Each `networks` call pops one scan result; an exhausted queue answers empty.
    pub fn push_scan(&self, networks: Vec<WifiNetwork>) {
        self.scans.lock().unwrap().push_back(networks);
    }

    pub fn current_state(&self) -> DeviceState {
        self.state.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, endpoint: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.endpoint == endpoint)
            .collect()
    }

    pub fn patches(&self) -> Vec<StatePatch> {
        self.patches
            .lock()
            .unwrap()
            .iter()
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn saved_wifi(&self) -> Option<(String, String)> {
        self.saved_wifi.lock().unwrap().clone()
    }

    async fn reach(
        &self,
        host: &str,
        endpoint: &'static str,
        timeout: Duration,
    ) -> Result<(), DeviceError> {
        self.calls.lock().unwrap().push(Call {
            at: Instant::now(),
            host: host.to_string(),
            endpoint,
        });
        let reach = self
            .hosts
            .lock()
            .unwrap()
            .get(host)
            .copied()
            .unwrap_or(Reach::Refused);
        match reach {
            Reach::Online => Ok(()),
            Reach::Timeout => {
                tokio::time::sleep(timeout).await;
                Err(DeviceError::Timeout)
            }
            Reach::Refused => Err(DeviceError::Unreachable(format!("{host} refused"))),
        }
    }
}

#[async_trait::async_trait]
impl DeviceApi for MockDevice {
    async fn info(&self, host: &str, timeout: Duration) -> Result<DeviceInfo, DeviceError> {
        self.reach(host, "info", timeout).await?;
        Ok(DeviceInfo {
            name: self.name.clone(),
            nw: None,
        })
    }

    async fn state(&self, host: &str) -> Result<DeviceState, DeviceError> {
        self.reach(host, "state", REQUEST_TIMEOUT).await?;
        Ok(self.current_state())
    }

    async fn update(&self, host: &str, patch: &StatePatch) -> Result<(), DeviceError> {
        self.reach(host, "update", REQUEST_TIMEOUT).await?;
        let delay = patch
            .seg
            .as_ref()
            .and_then(|seg| seg.first())
            .and_then(|seg| seg.col.first())
            .and_then(|rgb| self.slow_colors.lock().unwrap().get(rgb).copied());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.patches
            .lock()
            .unwrap()
            .push((host.to_string(), patch.clone()));

        let mut state = self.state.lock().unwrap();
        match patch.on {
            Some(Power::On) => state.on = true,
            Some(Power::Off) => state.on = false,
            Some(Power::Toggle) => state.on = !state.on,
            None => {}
        }
        if let Some(bri) = patch.bri {
            state.bri = bri;
        }
        if let Some(rgb) = patch
            .seg
            .as_ref()
            .and_then(|seg| seg.first())
            .and_then(|seg| seg.col.first())
        {
            if let Some(first) = state.seg.first_mut() {
                first.col = vec![rgb.to_vec()];
            }
        }
        if let Some(ps) = patch.ps {
            state.ps = Some(i32::from(ps));
            state.on = true;
        }
        Ok(())
    }

    async fn presets(&self, host: &str) -> Result<Vec<Preset>, DeviceError> {
        self.reach(host, "presets", REQUEST_TIMEOUT).await?;
        let raw = self.presets.lock().unwrap().clone();
        parse_presets(&raw)
    }

    async fn live(&self, host: &str) -> Result<LiveFrame, DeviceError> {
        self.reach(host, "live", REQUEST_TIMEOUT).await?;
        let state = self.current_state();
        let hex = state
            .primary_color()
            .map(|[r, g, b]| format!("{r:02X}{g:02X}{b:02X}"))
            .unwrap_or_default();
        Ok(LiveFrame { leds: vec![hex] })
    }

    async fn networks(&self, host: &str) -> Result<Vec<WifiNetwork>, DeviceError> {
        self.reach(host, "networks", REQUEST_TIMEOUT).await?;
        Ok(self.scans.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn save_wifi(&self, host: &str, ssid: &str, psk: &str) -> Result<(), DeviceError> {
        self.reach(host, "cfg", REQUEST_TIMEOUT).await?;
        *self.saved_wifi.lock().unwrap() = Some((ssid.to_string(), psk.to_string()));
        Ok(())
    }
}
