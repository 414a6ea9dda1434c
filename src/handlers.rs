// handlers.rs

use crate::{
    device::{LiveFrame, Preset, WifiNetwork},
    discovery::Controller,
    error::AppError,
    models::{
        AddressRequest, AppState, BrightnessRequest, ColorRequest, PowerRequest, PresetRequest,
        StatusView, WifiRequest, WsMessage,
    },
    provision,
    shell::Asset,
    utils,
};
use axum::{
    Json,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::Uri,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, mpsc};
use tracing::{error, info, warn};
use uuid::Uuid;
use validator::Validate;

type Shared = State<Arc<AppState>>;

fn current(state: &AppState) -> Json<StatusView> {
    Json(state.controller.status())
}

#[utoipa::path(
    get,
    path = "/api/status",
    tag = "connection",
    responses((status = 200, description = "Connection state and last known lamp state", body = StatusView))
)]
pub async fn get_status(State(state): Shared) -> Json<StatusView> {
    current(&state)
}

#[utoipa::path(
    post,
    path = "/api/retry",
    tag = "connection",
    responses(
        (status = 200, description = "Retry started", body = StatusView),
        (status = 409, description = "Not in the recovering state")
    )
)]
pub async fn retry(State(state): Shared) -> Result<Json<StatusView>, AppError> {
    state.controller.retry().await?;
    Ok(current(&state))
}

#[utoipa::path(
    post,
    path = "/api/setup",
    tag = "connection",
    responses(
        (status = 200, description = "Setup mode entered", body = StatusView),
        (status = 409, description = "Already connected")
    )
)]
pub async fn begin_setup(State(state): Shared) -> Result<Json<StatusView>, AppError> {
    state.controller.begin_setup().await?;
    Ok(current(&state))
}

#[utoipa::path(
    post,
    path = "/api/address",
    tag = "connection",
    request_body = AddressRequest,
    responses(
        (status = 200, description = "Connected to the given address", body = StatusView),
        (status = 422, description = "Blank address"),
        (status = 502, description = "Nothing answered at that address")
    )
)]
pub async fn use_address(
    State(state): Shared,
    Json(body): Json<AddressRequest>,
) -> Result<Json<StatusView>, AppError> {
    body.validate()?;
    state.controller.use_address(&body.host).await?;
    Ok(current(&state))
}

#[utoipa::path(
    post,
    path = "/api/disconnect",
    tag = "connection",
    responses((status = 200, description = "Saved address forgotten, detection restarted", body = StatusView))
)]
pub async fn disconnect(State(state): Shared) -> Result<Json<StatusView>, AppError> {
    state.controller.disconnect().await?;
    Ok(current(&state))
}

#[utoipa::path(
    post,
    path = "/api/power",
    tag = "lamp",
    request_body = PowerRequest,
    responses(
        (status = 200, description = "Power changed", body = StatusView),
        (status = 409, description = "Lamp not connected")
    )
)]
pub async fn power(
    State(state): Shared,
    Json(body): Json<PowerRequest>,
) -> Result<Json<StatusView>, AppError> {
    match body.on {
        Some(on) => state.controller.set_power(on).await?,
        None => state.controller.toggle_power().await?,
    }
    Ok(current(&state))
}

#[utoipa::path(
    post,
    path = "/api/brightness",
    tag = "lamp",
    request_body = BrightnessRequest,
    responses(
        (status = 200, description = "Brightness updated", body = StatusView),
        (status = 409, description = "Lamp not connected")
    )
)]
pub async fn brightness(
    State(state): Shared,
    Json(body): Json<BrightnessRequest>,
) -> Result<Json<StatusView>, AppError> {
    state
        .controller
        .set_brightness(body.level, body.phase)
        .await?;
    Ok(current(&state))
}

#[utoipa::path(
    post,
    path = "/api/color",
    tag = "lamp",
    request_body = ColorRequest,
    responses(
        (status = 200, description = "Color updated", body = StatusView),
        (status = 409, description = "Lamp not connected")
    )
)]
pub async fn color(
    State(state): Shared,
    Json(body): Json<ColorRequest>,
) -> Result<Json<StatusView>, AppError> {
    state
        .controller
        .set_color([body.r, body.g, body.b], body.phase)
        .await?;
    Ok(current(&state))
}

#[utoipa::path(
    post,
    path = "/api/preset",
    tag = "lamp",
    request_body = PresetRequest,
    responses(
        (status = 200, description = "Preset applied", body = StatusView),
        (status = 409, description = "Lamp not connected"),
        (status = 422, description = "Preset id out of range")
    )
)]
pub async fn apply_preset(
    State(state): Shared,
    Json(body): Json<PresetRequest>,
) -> Result<Json<StatusView>, AppError> {
    body.validate()?;
    state.controller.apply_preset(body.id).await?;
    Ok(current(&state))
}

#[utoipa::path(
    get,
    path = "/api/presets",
    tag = "lamp",
    responses(
        (status = 200, description = "Saved presets by id", body = Vec<Preset>),
        (status = 409, description = "Lamp not connected")
    )
)]
pub async fn list_presets(State(state): Shared) -> Result<Json<Vec<Preset>>, AppError> {
    Ok(Json(state.controller.presets().await?))
}

#[utoipa::path(
    get,
    path = "/api/live",
    tag = "lamp",
    responses(
        (status = 200, description = "Current LED colors", body = LiveFrame),
        (status = 409, description = "Lamp not connected")
    )
)]
pub async fn live(State(state): Shared) -> Result<Json<LiveFrame>, AppError> {
    Ok(Json(state.controller.live().await?))
}

#[utoipa::path(
    get,
    path = "/api/setup/networks",
    tag = "setup",
    responses(
        (status = 200, description = "Networks the lamp can see, strongest first", body = Vec<WifiNetwork>),
        (status = 502, description = "Lamp access point not reachable")
    )
)]
pub async fn scan_networks(State(state): Shared) -> Result<Json<Vec<WifiNetwork>>, AppError> {
    let lamp = &state.settings.lamp;
    let networks = provision::scan_networks(
        state.device.as_ref(),
        &lamp.access_point_host,
        lamp.request_timeout(),
    )
    .await?;
    Ok(Json(networks))
}

#[utoipa::path(
    post,
    path = "/api/setup/wifi",
    tag = "setup",
    request_body = WifiRequest,
    responses(
        (status = 200, description = "Credentials saved, lamp rebooting", body = StatusView),
        (status = 409, description = "Lamp refused the settings"),
        (status = 422, description = "Invalid network name or password")
    )
)]
pub async fn submit_wifi(
    State(state): Shared,
    Json(body): Json<WifiRequest>,
) -> Result<Json<StatusView>, AppError> {
    body.validate()?;
    let lamp = &state.settings.lamp;
    provision::submit_wifi(
        state.device.as_ref(),
        &lamp.access_point_host,
        &body.ssid,
        &body.psk,
        lamp.request_timeout(),
    )
    .await?;
    // the lamp comes back on the home network under a new address
    if let Err(e) = state.controller.begin_setup().await {
        info!(error = %e, "Not switching to setup after WiFi submit");
    }
    Ok(current(&state))
}

/// Prefixes served by the router itself; the shell never answers for them.
const RESERVED_PREFIXES: [&str; 4] = ["/api", "/ws", "/docs", "/api-doc"];

fn is_reserved(path: &str) -> bool {
    RESERVED_PREFIXES.iter().any(|prefix| {
        path.strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    })
}

/// Everything that is not API goes through the offline shell.
pub async fn serve_shell(State(state): Shared, uri: Uri) -> Result<Asset, AppError> {
    if is_reserved(uri.path()) {
        return Err(AppError::NotFound(uri.path().to_string()));
    }
    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
    let url = state.shell.resolve(path)?;
    Ok(state.shell.respond(&url).await?)
}

fn reserve_client_slot(state: &AppState) -> Result<OwnedSemaphorePermit, AppError> {
    state.client_slots.clone().try_acquire_owned().map_err(|_| {
        let limit = state.settings.server.max_connections;
        warn!(limit, "Rejecting client, connection limit reached");
        AppError::InvalidState("too many clients".into())
    })
}

pub async fn handle_client_ws_upgrade(ws: WebSocketUpgrade, State(state): Shared) -> Response {
    let slot = match reserve_client_slot(&state) {
        Ok(slot) => slot,
        Err(e) => return e.into_response(),
    };
    info!("Client connection attempt");
    ws.on_upgrade(|socket| handle_client(socket, state, slot))
}

async fn handle_client(socket: WebSocket, state: Arc<AppState>, _slot: OwnedSemaphorePermit) {
    let (mut sender, mut receiver) = socket.split();
    let client_id = Uuid::new_v4();
    state.clients.insert(client_id, Utc::now());
    info!(%client_id, "Client connected");

    let mut status = state.controller.subscribe();
    let (replies, mut replies_rx) = mpsc::unbounded_channel::<WsMessage>();

    let send_task = tokio::spawn(async move {
        // every client starts with the current status
        status.mark_changed();
        loop {
            let outgoing = tokio::select! {
                changed = status.changed() => match changed {
                    Ok(()) => WsMessage::StatusUpdate(status.borrow_and_update().clone()),
                    Err(_) => break,
                },
                Some(reply) = replies_rx.recv() => reply,
            };
            let text = match serde_json::to_string(&outgoing) {
                Ok(text) => text,
                Err(e) => {
                    error!(error = %e, "Failed to encode message");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn({
        let state = Arc::clone(&state);
        async move {
            while let Some(Ok(msg)) = receiver.next().await {
                let text = match msg {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let outcome = match serde_json::from_str::<WsMessage>(text.as_str()) {
                    Ok(command) => dispatch(&state.controller, command).await,
                    Err(e) => Err(AppError::Validation(format!("invalid message: {e}"))),
                };
                if let Err(e) = outcome {
                    warn!(%client_id, error = %e, "Client command failed");
                    let reply = WsMessage::Error {
                        message: e.to_string(),
                        code: e.status_code().as_u16(),
                    };
                    if replies.send(reply).is_err() {
                        break;
                    }
                }
            }
        }
    });

    tokio::pin!(send_task, recv_task);
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    };

    utils::cleanup_client_connection(client_id, &state).await;
}

async fn dispatch(controller: &Controller, message: WsMessage) -> Result<(), AppError> {
    match message {
        WsMessage::SetPower { power } => controller.set_power(power).await,
        WsMessage::TogglePower => controller.toggle_power().await,
        WsMessage::SetBrightness { brightness, phase } => {
            controller.set_brightness(brightness, phase).await
        }
        WsMessage::SetColor { color, phase } => controller.set_color(color, phase).await,
        WsMessage::ApplyPreset { preset } if (1..=250).contains(&preset) => {
            controller.apply_preset(preset).await
        }
        WsMessage::ApplyPreset { preset } => Err(AppError::Validation(format!(
            "preset {preset} is out of range"
        ))),
        WsMessage::UseAddress { host } => controller.use_address(&host).await,
        WsMessage::Retry => controller.retry().await,
        WsMessage::BeginSetup => controller.begin_setup().await,
        WsMessage::Disconnect => controller.disconnect().await,
        WsMessage::StatusUpdate(_) | WsMessage::Error { .. } => {
            Err(AppError::Validation("not a command".into()))
        }
    }
}
