// storage/mod.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Single durable slot holding the last address the lamp answered on.
#[async_trait::async_trait]
pub trait AddressStore: Send + Sync {
    async fn load(&self) -> io::Result<Option<String>>;
    async fn save(&self, host: &str) -> io::Result<()>;
    async fn clear(&self) -> io::Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedAddress {
    host: String,
    saved_at: DateTime<Utc>,
}

/// JSON file store. Writes go to a temp file that is renamed over the target.
pub struct FileAddressStore {
    path: PathBuf,
}

impl FileAddressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[cfg(test)]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }
}

#[async_trait::async_trait]
impl AddressStore for FileAddressStore {
    async fn load(&self) -> io::Result<Option<String>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        match serde_json::from_slice::<SavedAddress>(&raw) {
            Ok(saved) if !saved.host.trim().is_empty() => {
                debug!(host = %saved.host, saved_at = %saved.saved_at, "Loaded lamp address");
                Ok(Some(saved.host))
            }
            Ok(_) => Ok(None),
            Err(e) => {
                // unreadable slot behaves like an empty one
                warn!(path = %self.path.display(), error = %e, "Ignoring corrupt address file");
                Ok(None)
            }
        }
    }

    async fn save(&self, host: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let saved = SavedAddress {
            host: host.to_string(),
            saved_at: Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&saved).map_err(io::Error::other)?;
        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }

    async fn clear(&self) -> io::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct MemoryAddressStore {
    slot: std::sync::Mutex<Option<String>>,
}

#[cfg(test)]
impl MemoryAddressStore {
    pub fn with_host(host: &str) -> Self {
        Self {
            slot: std::sync::Mutex::new(Some(host.to_string())),
        }
    }

    pub fn get(&self) -> Option<String> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl AddressStore for MemoryAddressStore {
    async fn load(&self) -> io::Result<Option<String>> {
        Ok(self.get())
    }

    async fn save(&self, host: &str) -> io::Result<()> {
        *self.slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(host.to_string());
        Ok(())
    }

    async fn clear(&self) -> io::Result<()> {
        *self.slot.lock().unwrap_or_else(|p| p.into_inner()) = None;
        Ok(())
    }
}
