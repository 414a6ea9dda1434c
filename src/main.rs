// main.rs
mod config;
mod device;
mod discovery;
mod docs;
mod error;
mod handlers;
mod metrics;
mod models;
mod provision;
mod shell;
mod storage;
mod utils;

use axum::{
    Router,
    routing::{get, post},
};
use device::WledClient;
use discovery::{Controller, DiscoveryOptions};
use handlers::*;
use models::AppState;
use shell::ShellWorker;
use std::sync::Arc;
use storage::FileAddressStore;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = config::Settings::new()
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    if settings.metrics.enabled {
        metrics::setup_metrics(settings.metrics.port)?;
        tracing::info!(port = settings.metrics.port, "Metrics exporter listening");
    }

    let device = Arc::new(
        WledClient::new(settings.lamp.request_timeout())
            .map_err(|e| anyhow::anyhow!("Failed to build lamp client: {}", e))?,
    );
    let store = Arc::new(FileAddressStore::new(&settings.lamp.address_file));
    let controller = Controller::spawn(
        device.clone(),
        store,
        DiscoveryOptions::from_settings(&settings),
    );

    let shell = Arc::new(ShellWorker::from_settings(
        &settings.shell,
        settings.lamp.request_timeout(),
    )?);
    tokio::spawn(shell::run_lifecycle(
        shell.clone(),
        settings.shell.install_retry(),
    ));

    let address = settings.server.address.clone();
    let state = Arc::new(AppState::new(controller, device, shell, settings));

    let app = Router::new()
        .route("/api/status", get(get_status))
        .route("/api/retry", post(retry))
        .route("/api/setup", post(begin_setup))
        .route("/api/address", post(use_address))
        .route("/api/disconnect", post(disconnect))
        .route("/api/power", post(power))
        .route("/api/brightness", post(brightness))
        .route("/api/color", post(color))
        .route("/api/preset", post(apply_preset))
        .route("/api/presets", get(list_presets))
        .route("/api/live", get(live))
        .route("/api/setup/networks", get(scan_networks))
        .route("/api/setup/wifi", post(submit_wifi))
        .route("/ws/client", get(handle_client_ws_upgrade))
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", docs::ApiDoc::openapi()))
        .fallback(serve_shell)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind address: {}", e))?;

    tracing::info!("Server started on {}", address);

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
