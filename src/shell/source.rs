// shell/source.rs
use super::Asset;
use crate::error::CacheError;
use axum::body::Bytes;
use reqwest::{
    Url,
    header::{CACHE_CONTROL, CONTENT_TYPE, PRAGMA},
};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Default,
    /// Skip any intermediate HTTP cache.
    Reload,
}

/// Where the shell comes from when the network is up.
#[async_trait::async_trait]
pub trait AssetSource: Send + Sync {
    async fn fetch(&self, url: &Url, mode: FetchMode) -> Result<Asset, CacheError>;
}

fn network_error(url: &Url, reason: impl ToString) -> CacheError {
    CacheError::Network {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

pub struct HttpSource {
    http: reqwest::Client,
}

impl HttpSource {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

#[async_trait::async_trait]
impl AssetSource for HttpSource {
    async fn fetch(&self, url: &Url, mode: FetchMode) -> Result<Asset, CacheError> {
        let mut request = self.http.get(url.clone());
        if mode == FetchMode::Reload {
            request = request
                .header(CACHE_CONTROL, "no-cache")
                .header(PRAGMA, "no-cache");
        }
        let response = request.send().await.map_err(|e| network_error(url, e))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes().await.map_err(|e| network_error(url, e))?;
        debug!(%url, status, ?mode, "Fetched shell asset");
        Ok(Asset {
            status,
            content_type,
            body,
        })
    }
}

/// Serves the shell from a local directory mounted under `base`.
pub struct DirSource {
    root: PathBuf,
    base: Url,
}

impl DirSource {
    pub fn new(root: impl Into<PathBuf>, base: Url) -> Self {
        Self {
            root: root.into(),
            base,
        }
    }

    /// Maps a URL onto a file below `root`; `None` for anything outside it.
    fn file_for(&self, url: &Url) -> Option<PathBuf> {
        let relative = url.path().strip_prefix(self.base.path())?;
        let mut path = self.root.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        if relative.is_empty() || relative.ends_with('/') {
            path.push("index.html");
        }
        Some(path)
    }
}

fn content_type_for(path: &Path) -> Option<&'static str> {
    let content_type = match path.extension()?.to_str()? {
        "html" => "text/html; charset=utf-8",
        "js" => "text/javascript; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "json" => "application/json",
        "webmanifest" => "application/manifest+json",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        _ => return None,
    };
    Some(content_type)
}

fn not_found() -> Asset {
    Asset {
        status: 404,
        content_type: Some("text/plain; charset=utf-8".into()),
        body: Bytes::from_static(b"not found"),
    }
}

#[async_trait::async_trait]
impl AssetSource for DirSource {
    async fn fetch(&self, url: &Url, _mode: FetchMode) -> Result<Asset, CacheError> {
        if url.origin() != self.base.origin() {
            return Err(network_error(url, "not served by this directory"));
        }
        let Some(path) = self.file_for(url) else {
            return Ok(not_found());
        };
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(Asset {
                status: 200,
                content_type: content_type_for(&path).map(str::to_owned),
                body: Bytes::from(body),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(not_found()),
            Err(e) => Err(network_error(url, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sealamp-shell-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("index.html"), "<html></html>").unwrap();
        std::fs::write(dir.join("app.js"), "console.log(1)").unwrap();
        dir
    }

    #[tokio::test]
    async fn dir_source_serves_index_for_root() {
        let dir = scratch_dir();
        let base = Url::parse("http://sealamp.localhost/").unwrap();
        let source = DirSource::new(&dir, base.clone());

        let index = source.fetch(&base, FetchMode::Reload).await.unwrap();
        assert_eq!(index.status, 200);
        assert_eq!(index.content_type.as_deref(), Some("text/html; charset=utf-8"));

        let script = source
            .fetch(&base.join("app.js").unwrap(), FetchMode::Default)
            .await
            .unwrap();
        assert_eq!(&script.body[..], b"console.log(1)");

        let missing = source
            .fetch(&base.join("icon-192.png").unwrap(), FetchMode::Default)
            .await
            .unwrap();
        assert_eq!(missing.status, 404);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn dir_source_refuses_to_leave_its_root() {
        let dir = scratch_dir();
        let base = Url::parse("http://sealamp.localhost/shell/").unwrap();
        let source = DirSource::new(&dir, base);

        let outside = Url::parse("http://sealamp.localhost/other/app.js").unwrap();
        assert_eq!(source.fetch(&outside, FetchMode::Default).await.unwrap().status, 404);

        let foreign = Url::parse("http://example.com/shell/app.js").unwrap();
        assert!(source.fetch(&foreign, FetchMode::Default).await.is_err());

        let _ = std::fs::remove_dir_all(dir);
    }
}
