// error.rs
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Failures talking to the lamp. All of them are soft: callers log and move on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("request timed out")]
    Timeout,
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for DeviceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DeviceError::Timeout
        } else if err.is_decode() {
            DeviceError::Malformed(err.to_string())
        } else if let Some(status) = err.status() {
            DeviceError::Status(status.as_u16())
        } else {
            DeviceError::Unreachable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for DeviceError {
    fn from(err: serde_json::Error) -> Self {
        DeviceError::Malformed(err.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("network error for {url}: {reason}")]
    Network { url: String, reason: String },
    #[error("offline and no cached copy of {0}")]
    Offline(String),
    #[error("install failed on {asset}: {reason}")]
    Install { asset: String, reason: String },
    #[error("worker is {0}")]
    InvalidState(String),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Lamp is not connected")]
    NotConnected,
    #[error("Not available right now: {0}")]
    InvalidState(String),
    #[error("Could not reach lamp at {host}")]
    Unreachable { host: String },
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("No such route: {0}")]
    NotFound(String),
    #[error("Connection controller stopped")]
    ControllerStopped,
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Validation(err.to_string())
    }
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::NotConnected | AppError::InvalidState(_) => StatusCode::CONFLICT,
            AppError::Unreachable { .. } | AppError::Device(_) => StatusCode::BAD_GATEWAY,
            AppError::Cache(err) => err.status_code(),
            AppError::ControllerStopped => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl CacheError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            CacheError::Network { .. } => StatusCode::GATEWAY_TIMEOUT,
            CacheError::Offline(_) | CacheError::Install { .. } | CacheError::InvalidState(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        AppError::Cache(self).into_response()
    }
}
