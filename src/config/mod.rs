// config/mod.rs
use serde::Deserialize;
use config::Config;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub metrics: MetricsSettings,
    pub lamp: LampSettings,
    pub discovery: DiscoverySettings,
    pub shell: ShellSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub address: String,
    /// Upper bound on concurrent WebSocket clients.
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LampSettings {
    /// mDNS name the lamp advertises once it is on the home network.
    pub well_known_host: String,
    /// Address of the lamp while it runs its own setup access point.
    pub access_point_host: String,
    pub address_file: String,
    pub probe_timeout_ms: u64,
    pub access_point_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Fade time in tenths of a second sent with every command.
    pub transition: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverySettings {
    pub setup_interval_ms: u64,
    pub sync_interval_ms: u64,
    pub color_throttle_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShellSettings {
    pub generation: String,
    pub assets: Vec<String>,
    /// Origin the shell is fetched from. When unset, `dir` is served instead.
    pub upstream: Option<String>,
    pub dir: String,
    pub install_retry_ms: u64,
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let settings = Config::builder()
            .set_default("server.address", "0.0.0.0:8080")?
            .set_default("server.max_connections", 32)?
            .set_default("metrics.enabled", false)?
            .set_default("metrics.port", 9090)?
            .set_default("lamp.well_known_host", "seazencity.local")?
            .set_default("lamp.access_point_host", "4.3.2.1")?
            .set_default("lamp.address_file", "data/lamp_host.json")?
            .set_default("lamp.probe_timeout_ms", 3000)?
            .set_default("lamp.access_point_timeout_ms", 2500)?
            .set_default("lamp.request_timeout_ms", 3000)?
            .set_default("discovery.setup_interval_ms", 4000)?
            .set_default("discovery.sync_interval_ms", 5000)?
            .set_default("discovery.color_throttle_ms", 150)?
            .set_default("shell.generation", "sealamp-pwa-v5")?
            .set_default(
                "shell.assets",
                vec![
                    "./",
                    "./index.html",
                    "./styles.css",
                    "./app.js",
                    "./manifest.webmanifest",
                    "./icon-192.png",
                    "./icon-512.png",
                ],
            )?
            .set_default("shell.dir", "static")?
            .set_default("shell.install_retry_ms", 30_000)?
            .add_source(config::File::with_name("config/config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        settings.try_deserialize()
    }
}

impl LampSettings {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn access_point_timeout(&self) -> Duration {
        Duration::from_millis(self.access_point_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl DiscoverySettings {
    pub fn setup_interval(&self) -> Duration {
        Duration::from_millis(self.setup_interval_ms)
    }

    /// Clamped to the 2.5–10 s range the lamp tolerates.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms.clamp(2500, 10_000))
    }

    pub fn color_throttle(&self) -> Duration {
        Duration::from_millis(self.color_throttle_ms)
    }
}

impl ShellSettings {
    pub fn install_retry(&self) -> Duration {
        Duration::from_millis(self.install_retry_ms)
    }
}
