// utils.rs
use super::models::AppState;
use uuid::Uuid;
use tracing::info;

pub async fn cleanup_client_connection(client_id: Uuid, state: &AppState) {
    state.clients.remove(&client_id);
    info!("Client {} disconnected", client_id);
}

/// Reduces what a user types ("http://192.168.1.73/") to a bare host.
pub fn normalize_host(input: &str) -> String {
    let trimmed = input.trim();
    let without_scheme = trimmed
        .strip_prefix("http://")
        .or_else(|| trimmed.strip_prefix("https://"))
        .unwrap_or(trimmed);
    without_scheme
        .split('/')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}
