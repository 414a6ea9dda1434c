// device/wled.rs
use super::{
    DeviceApi, DeviceInfo, DeviceState, LiveFrame, NetworkScan, Preset, StatePatch, WifiNetwork,
    parse_presets,
};
use crate::error::DeviceError;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// reqwest client for the lamp's embedded JSON API.
pub struct WledClient {
    http: reqwest::Client,
    request_timeout: Duration,
}

impl WledClient {
    pub fn new(request_timeout: Duration) -> Result<Self, DeviceError> {
        let http = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            request_timeout,
        })
    }

    fn url(host: &str, path: &str) -> String {
        format!("http://{host}{path}")
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        host: &str,
        path: &str,
        timeout: Duration,
    ) -> Result<T, DeviceError> {
        let url = Self::url(host, path);
        debug!(%url, "GET");
        let response = self.http.get(&url).timeout(timeout).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeviceError::Status(status.as_u16()));
        }
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        host: &str,
        path: &str,
        body: &B,
    ) -> Result<(), DeviceError> {
        let url = Self::url(host, path);
        debug!(%url, "POST");
        let response = self
            .http
            .post(&url)
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeviceError::Status(status.as_u16()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl DeviceApi for WledClient {
    async fn info(&self, host: &str, timeout: Duration) -> Result<DeviceInfo, DeviceError> {
        self.get_json(host, "/json/info", timeout).await
    }

    async fn state(&self, host: &str) -> Result<DeviceState, DeviceError> {
        self.get_json(host, "/json/state", self.request_timeout).await
    }

    async fn update(&self, host: &str, patch: &StatePatch) -> Result<(), DeviceError> {
        self.post_json(host, "/json/state", patch).await
    }

    async fn presets(&self, host: &str) -> Result<Vec<Preset>, DeviceError> {
        let raw: serde_json::Value = self
            .get_json(host, "/presets.json", self.request_timeout)
            .await?;
        parse_presets(&raw)
    }

    async fn live(&self, host: &str) -> Result<LiveFrame, DeviceError> {
        self.get_json(host, "/json/live", self.request_timeout).await
    }

    async fn networks(&self, host: &str) -> Result<Vec<WifiNetwork>, DeviceError> {
        let scan: NetworkScan = self
            .get_json(host, "/json/net", self.request_timeout)
            .await?;
        Ok(scan.networks)
    }

    async fn save_wifi(&self, host: &str, ssid: &str, psk: &str) -> Result<(), DeviceError> {
        let body = json!({
            "nw": { "ins": [{ "ssid": ssid, "psk": psk }] },
            "id": { "frun": false },
        });
        self.post_json(host, "/json/cfg", &body).await
    }
}
