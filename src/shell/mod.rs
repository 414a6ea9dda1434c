// shell/mod.rs
//! Offline app shell.
//!
//! Works like the page's service worker: a fixed asset list is installed into
//! one named generation, activation drops every other generation, and each
//! same-origin request is answered network-first (markup and script) or
//! cache-first (everything else).

mod source;
mod store;

pub use source::{AssetSource, DirSource, FetchMode, HttpSource};
pub use store::CacheStorage;

use crate::config::ShellSettings;
use crate::error::CacheError;
use crate::metrics;
use axum::{
    body::Bytes,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use reqwest::Url;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Origin the local shell directory is mounted under.
const DIR_ORIGIN: &str = "http://sealamp.localhost/";

/// Entries a generation may gain at runtime on top of the installed assets.
const RUNTIME_ENTRIES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl Asset {
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl IntoResponse for Asset {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut response = (status, self.body).into_response();
        if let Some(content_type) = self
            .content_type
            .and_then(|ct| HeaderValue::from_str(&ct).ok())
        {
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, content_type);
        }
        response
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Installing,
    Installed,
    Activating,
    Active,
    Redundant,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Interception {
    /// Not ours to answer; the request goes straight to the network.
    PassThrough,
    Respond(Asset),
}

pub struct ShellWorker {
    origin: Url,
    generation: String,
    assets: Vec<String>,
    source: Arc<dyn AssetSource>,
    caches: CacheStorage,
    state: RwLock<WorkerState>,
}

impl ShellWorker {
    pub fn new(
        origin: Url,
        generation: impl Into<String>,
        assets: Vec<String>,
        source: Arc<dyn AssetSource>,
    ) -> Self {
        Self {
            origin,
            generation: generation.into(),
            assets,
            source,
            caches: CacheStorage::default(),
            state: RwLock::new(WorkerState::Installing),
        }
    }

    pub fn from_settings(settings: &ShellSettings, timeout: Duration) -> anyhow::Result<Self> {
        let (origin, source) = match &settings.upstream {
            Some(upstream) => {
                let mut origin = Url::parse(upstream)?;
                if !origin.path().ends_with('/') {
                    let path = format!("{}/", origin.path());
                    origin.set_path(&path);
                }
                let source: Arc<dyn AssetSource> = Arc::new(HttpSource::new(timeout)?);
                (origin, source)
            }
            None => {
                let origin = Url::parse(DIR_ORIGIN)?;
                let source: Arc<dyn AssetSource> =
                    Arc::new(DirSource::new(&settings.dir, origin.clone()));
                (origin, source)
            }
        };
        info!(%origin, generation = %settings.generation, "Shell source configured");
        Ok(Self::new(
            origin,
            settings.generation.clone(),
            settings.assets.clone(),
            source,
        ))
    }

    pub fn state(&self) -> WorkerState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: WorkerState) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        debug!(from = ?*state, to = ?next, "Shell worker state");
        *state = next;
    }

    #[cfg(test)]
    pub fn caches(&self) -> &CacheStorage {
        &self.caches
    }

    /// Maps a local request path onto the shell's origin.
    pub fn resolve(&self, path_and_query: &str) -> Result<Url, CacheError> {
        self.origin
            .join(path_and_query.trim_start_matches('/'))
            .map_err(|e| CacheError::Network {
                url: path_and_query.to_string(),
                reason: e.to_string(),
            })
    }

    /// Query strings are ignored, so cache-busting parameters share one entry.
    fn cache_key(url: &Url) -> String {
        let mut url = url.clone();
        url.set_query(None);
        url.set_fragment(None);
        url.into()
    }

    /// Refreshes an existing entry, or adds one while the generation has room.
    fn store(&self, key: &str, asset: Asset) {
        let known = self.caches.lookup(&self.generation, key).is_some();
        if known || self.caches.len(&self.generation) < self.assets.len() + RUNTIME_ENTRIES {
            self.caches.put(&self.generation, key, asset);
        } else {
            debug!(%key, "Shell generation full, not caching");
        }
    }

    /// Fetches the whole asset list; nothing is stored unless every asset arrived.
    pub async fn install(&self) -> Result<(), CacheError> {
        match self.state() {
            WorkerState::Installing | WorkerState::Redundant => {}
            other => return Err(CacheError::InvalidState(format!("{other:?}"))),
        }
        self.set_state(WorkerState::Installing);

        let mut fetched = Vec::with_capacity(self.assets.len());
        for asset in &self.assets {
            match self.fetch_for_install(asset).await {
                Ok(entry) => fetched.push(entry),
                Err(e) => {
                    self.set_state(WorkerState::Redundant);
                    return Err(e);
                }
            }
        }

        self.caches.open(&self.generation);
        for (key, asset) in fetched {
            self.caches.put(&self.generation, &key, asset);
        }
        self.set_state(WorkerState::Installed);
        info!(
            generation = %self.generation,
            assets = self.assets.len(),
            "Shell installed"
        );
        Ok(())
    }

    async fn fetch_for_install(&self, asset: &str) -> Result<(String, Asset), CacheError> {
        let install_error = |reason: String| CacheError::Install {
            asset: asset.to_string(),
            reason,
        };
        let url = self
            .origin
            .join(asset)
            .map_err(|e| install_error(e.to_string()))?;
        let fetched = self
            .source
            .fetch(&url, FetchMode::Reload)
            .await
            .map_err(|e| install_error(e.to_string()))?;
        if !fetched.is_ok() {
            return Err(install_error(format!("HTTP {}", fetched.status)));
        }
        Ok((Self::cache_key(&url), fetched))
    }

    /// Drops every generation but the current one, then starts intercepting.
    pub async fn activate(&self) -> Result<(), CacheError> {
        if self.state() != WorkerState::Installed {
            return Err(CacheError::InvalidState(format!("{:?}", self.state())));
        }
        self.set_state(WorkerState::Activating);
        for name in self.caches.keys() {
            if name != self.generation && self.caches.delete(&name) {
                info!(generation = %name, "Deleted stale shell generation");
            }
        }
        self.set_state(WorkerState::Active);
        Ok(())
    }

    pub async fn intercept(&self, url: &Url) -> Result<Interception, CacheError> {
        if self.state() != WorkerState::Active {
            return Ok(Interception::PassThrough);
        }
        if url.origin() != self.origin.origin() {
            return Ok(Interception::PassThrough);
        }
        let asset = if is_dynamic(url) {
            self.network_first(url).await?
        } else {
            self.cache_first(url).await?
        };
        Ok(Interception::Respond(asset))
    }

    /// Answers a request the way a page controlled by this worker would see it.
    pub async fn respond(&self, url: &Url) -> Result<Asset, CacheError> {
        match self.intercept(url).await? {
            Interception::Respond(asset) => Ok(asset),
            Interception::PassThrough => {
                metrics::shell_served("passthrough", "network");
                self.source.fetch(url, FetchMode::Default).await
            }
        }
    }

    async fn network_first(&self, url: &Url) -> Result<Asset, CacheError> {
        let key = Self::cache_key(url);
        match self.source.fetch(url, FetchMode::Reload).await {
            Ok(asset) => {
                if asset.is_ok() {
                    self.store(&key, asset.clone());
                }
                metrics::shell_served("network_first", "network");
                Ok(asset)
            }
            Err(e) => match self.caches.lookup(&self.generation, &key) {
                Some(cached) => {
                    debug!(%url, error = %e, "Network failed, serving cached copy");
                    metrics::shell_served("network_first", "cache");
                    Ok(cached)
                }
                None => {
                    warn!(%url, error = %e, "Network failed and nothing cached");
                    Err(CacheError::Offline(key))
                }
            },
        }
    }

    async fn cache_first(&self, url: &Url) -> Result<Asset, CacheError> {
        let key = Self::cache_key(url);
        if let Some(cached) = self.caches.lookup(&self.generation, &key) {
            metrics::shell_served("cache_first", "cache");
            return Ok(cached);
        }
        let asset = self.source.fetch(url, FetchMode::Default).await?;
        if asset.is_ok() {
            self.store(&key, asset.clone());
        }
        metrics::shell_served("cache_first", "network");
        Ok(asset)
    }
}

/// Markup and script change with every release and must be fetched fresh.
fn is_dynamic(url: &Url) -> bool {
    let path = url.path();
    path.ends_with('/') || path.ends_with(".html") || path.ends_with(".js")
}

/// Installs until it succeeds, then activates.
pub async fn run_lifecycle(worker: Arc<ShellWorker>, retry: Duration) {
    loop {
        match worker.install().await {
            Ok(()) => break,
            Err(e) => {
                warn!(error = %e, retry_in = ?retry, "Shell install failed");
                tokio::time::sleep(retry).await;
            }
        }
    }
    if let Err(e) = worker.activate().await {
        error!(error = %e, "Shell activation failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    const ORIGIN: &str = "https://lamp.example/sealamp/";

    struct MockSource {
        files: Mutex<HashMap<String, Asset>>,
        online: AtomicBool,
        requests: Mutex<Vec<(String, FetchMode)>>,
    }

    impl MockSource {
        fn new() -> Self {
            Self {
                files: Mutex::new(HashMap::new()),
                online: AtomicBool::new(true),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn serve(&self, path: &str, body: &'static str) {
            let url = format!("{ORIGIN}{path}");
            self.files.lock().unwrap().insert(url, asset(body));
        }

        fn set_online(&self, online: bool) {
            self.online.store(online, Ordering::SeqCst);
        }

        fn requests(&self) -> Vec<(String, FetchMode)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl AssetSource for MockSource {
        async fn fetch(&self, url: &Url, mode: FetchMode) -> Result<Asset, CacheError> {
            self.requests.lock().unwrap().push((url.to_string(), mode));
            if !self.online.load(Ordering::SeqCst) {
                return Err(CacheError::Network {
                    url: url.to_string(),
                    reason: "offline".into(),
                });
            }
            Ok(self
                .files
                .lock()
                .unwrap()
                .get(url.as_str())
                .cloned()
                .unwrap_or(Asset {
                    status: 404,
                    content_type: None,
                    body: Bytes::new(),
                }))
        }
    }

    fn asset(body: &'static str) -> Asset {
        Asset {
            status: 200,
            content_type: None,
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    fn url(path: &str) -> Url {
        Url::parse(ORIGIN).unwrap().join(path).unwrap()
    }

    fn shell_source() -> Arc<MockSource> {
        let source = Arc::new(MockSource::new());
        source.serve("", "<html>root</html>");
        source.serve("index.html", "<html>v1</html>");
        source.serve("app.js", "v1()");
        source.serve("styles.css", "body{}");
        source
    }

    fn worker(source: &Arc<MockSource>, generation: &str) -> ShellWorker {
        ShellWorker::new(
            Url::parse(ORIGIN).unwrap(),
            generation,
            vec![
                "./".to_string(),
                "./index.html".to_string(),
                "./app.js".to_string(),
                "./styles.css".to_string(),
            ],
            source.clone(),
        )
    }

    async fn active_worker(source: &Arc<MockSource>) -> ShellWorker {
        let worker = worker(source, "sealamp-pwa-v5");
        worker.install().await.unwrap();
        worker.activate().await.unwrap();
        worker
    }

    fn served(interception: Interception) -> Asset {
        match interception {
            Interception::Respond(asset) => asset,
            Interception::PassThrough => panic!("expected the worker to answer"),
        }
    }

    #[tokio::test]
    async fn install_fills_current_generation_bypassing_caches() {
        let source = shell_source();
        let worker = worker(&source, "sealamp-pwa-v5");
        worker.install().await.unwrap();

        assert_eq!(worker.state(), WorkerState::Installed);
        assert_eq!(worker.caches().len("sealamp-pwa-v5"), 4);
        assert!(source.requests().iter().all(|(_, mode)| *mode == FetchMode::Reload));
    }

    #[tokio::test]
    async fn failed_install_stores_nothing() {
        let source = shell_source();
        let worker = ShellWorker::new(
            Url::parse(ORIGIN).unwrap(),
            "sealamp-pwa-v6",
            vec!["./index.html".to_string(), "./icon-512.png".to_string()],
            source.clone(),
        );

        let err = worker.install().await.unwrap_err();
        assert!(matches!(err, CacheError::Install { ref asset, .. } if asset == "./icon-512.png"));
        assert_eq!(worker.state(), WorkerState::Redundant);
        assert_eq!(worker.caches().len("sealamp-pwa-v6"), 0);
        assert!(matches!(worker.activate().await, Err(CacheError::InvalidState(_))));
    }

    #[tokio::test]
    async fn activation_keeps_only_current_generation() {
        let source = shell_source();
        let worker = worker(&source, "v3");
        for old in ["v1", "v2"] {
            worker.caches().put(old, "https://lamp.example/sealamp/app.js", asset("old()"));
        }
        worker.install().await.unwrap();
        worker.activate().await.unwrap();

        assert_eq!(worker.caches().keys(), vec!["v3".to_string()]);
        assert_eq!(worker.state(), WorkerState::Active);
    }

    #[tokio::test]
    async fn script_is_fetched_fresh_and_recached() {
        let source = shell_source();
        let worker = active_worker(&source).await;
        source.serve("app.js", "v2()");

        let asset = served(worker.intercept(&url("app.js")).await.unwrap());
        assert_eq!(&asset.body[..], b"v2()");
        assert_eq!(source.requests().last().unwrap().1, FetchMode::Reload);

        source.set_online(false);
        let asset = served(worker.intercept(&url("app.js")).await.unwrap());
        assert_eq!(&asset.body[..], b"v2()");
    }

    #[tokio::test]
    async fn markup_falls_back_to_cache_when_offline() {
        let source = shell_source();
        let worker = active_worker(&source).await;
        source.set_online(false);

        let asset = served(worker.intercept(&url("")).await.unwrap());
        assert_eq!(&asset.body[..], b"<html>root</html>");
        let asset = served(worker.intercept(&url("index.html")).await.unwrap());
        assert_eq!(&asset.body[..], b"<html>v1</html>");
    }

    #[tokio::test]
    async fn uncached_script_fails_when_offline() {
        let source = shell_source();
        let worker = active_worker(&source).await;
        source.set_online(false);

        let err = worker.intercept(&url("extra.js")).await.unwrap_err();
        assert!(matches!(err, CacheError::Offline(_)));
    }

    #[tokio::test]
    async fn error_responses_are_returned_but_not_cached() {
        let source = shell_source();
        let worker = active_worker(&source).await;

        let asset = served(worker.intercept(&url("missing.js")).await.unwrap());
        assert_eq!(asset.status, 404);
        source.set_online(false);
        assert!(worker.intercept(&url("missing.js")).await.is_err());
    }

    #[tokio::test]
    async fn static_assets_are_cache_first() {
        let source = shell_source();
        let worker = active_worker(&source).await;
        source.serve("styles.css", "body{color:red}");
        let before = source.requests().len();

        let asset = served(worker.intercept(&url("styles.css")).await.unwrap());
        assert_eq!(&asset.body[..], b"body{}");
        assert_eq!(source.requests().len(), before);

        // a miss goes to the network once and is kept for next time
        source.serve("icon-192.png", "png");
        served(worker.intercept(&url("icon-192.png")).await.unwrap());
        source.set_online(false);
        let asset = served(worker.intercept(&url("icon-192.png")).await.unwrap());
        assert_eq!(&asset.body[..], b"png");
    }

    #[tokio::test]
    async fn cache_busting_queries_share_one_entry() {
        let source = shell_source();
        let worker = active_worker(&source).await;
        let installed = worker.caches().len("sealamp-pwa-v5");

        for n in 0..500 {
            let asset = served(
                worker
                    .intercept(&url(&format!("styles.css?cb={n}")))
                    .await
                    .unwrap(),
            );
            assert_eq!(&asset.body[..], b"body{}");
        }
        for n in 0..50 {
            served(worker.intercept(&url(&format!("app.js?v={n}"))).await.unwrap());
        }
        assert_eq!(worker.caches().len("sealamp-pwa-v5"), installed);
    }

    #[tokio::test]
    async fn runtime_entries_are_capped() {
        let source = shell_source();
        let worker = active_worker(&source).await;
        let installed = worker.caches().len("sealamp-pwa-v5");

        let paths: Vec<String> = (0..100).map(|n| format!("img/{n}.png")).collect();
        for path in &paths {
            let url = format!("{ORIGIN}{path}");
            source.files.lock().unwrap().insert(url, asset("png"));
        }
        for path in &paths {
            assert_eq!(served(worker.intercept(&url(path)).await.unwrap()).status, 200);
        }
        assert_eq!(
            worker.caches().len("sealamp-pwa-v5"),
            installed + RUNTIME_ENTRIES
        );

        // installed assets still refresh when the generation is full
        source.serve("app.js", "v9()");
        served(worker.intercept(&url("app.js")).await.unwrap());
        source.set_online(false);
        let asset = served(worker.intercept(&url("app.js")).await.unwrap());
        assert_eq!(&asset.body[..], b"v9()");
    }

    #[tokio::test]
    async fn foreign_origin_and_inactive_worker_pass_through() {
        let source = shell_source();
        let idle = worker(&source, "sealamp-pwa-v5");
        assert_eq!(
            idle.intercept(&url("app.js")).await.unwrap(),
            Interception::PassThrough
        );

        let worker = active_worker(&source).await;
        let lamp_api = Url::parse("http://192.168.1.73/json/state").unwrap();
        assert_eq!(
            worker.intercept(&lamp_api).await.unwrap(),
            Interception::PassThrough
        );
    }

    #[tokio::test]
    async fn resolve_maps_local_paths_under_origin() {
        let source = shell_source();
        let worker = worker(&source, "sealamp-pwa-v5");
        assert_eq!(
            worker.resolve("/app.js?v=2").unwrap().as_str(),
            "https://lamp.example/sealamp/app.js?v=2"
        );
        assert_eq!(worker.resolve("/").unwrap().as_str(), ORIGIN);
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_retries_install_until_online() {
        let source = shell_source();
        source.set_online(false);
        let worker = Arc::new(worker(&source, "sealamp-pwa-v5"));
        let task = tokio::spawn(run_lifecycle(worker.clone(), Duration::from_secs(30)));

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(worker.state(), WorkerState::Redundant);

        source.set_online(true);
        task.await.unwrap();
        assert_eq!(worker.state(), WorkerState::Active);
        assert_eq!(worker.caches().len("sealamp-pwa-v5"), 4);
    }
}
