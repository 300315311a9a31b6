//! REST API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rollcall_core::NetworkSettings;
use rollcall_discovery::DiscoveryError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::state::AppState;

/// API error response
#[derive(Serialize)]
struct ApiError {
    error: String,
}

impl ApiError {
    fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}

fn error_response(e: DiscoveryError) -> Response {
    let status = if e.is_client_error() {
        StatusCode::BAD_REQUEST
    } else if e.is_not_found() {
        StatusCode::NOT_FOUND
    } else {
        warn!(error = %e, "Request failed");
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(ApiError::new(e.to_string()))).into_response()
}

/// Static discovery request body
#[derive(Deserialize)]
pub struct StaticDiscoveryRequest {
    pub ip_range_start: String,
    pub ip_range_end: String,
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout: u64,
    #[serde(default = "default_concurrent_scans")]
    pub concurrent_scans: usize,
}

fn default_scan_timeout() -> u64 {
    1
}

fn default_concurrent_scans() -> usize {
    50
}

fn started(session_id: String) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "status": "started",
            "session_id": session_id
        })),
    )
        .into_response()
}

/// Start a discovery over an explicit range
pub async fn start_static_discovery(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StaticDiscoveryRequest>,
) -> impl IntoResponse {
    match state.service.start_static_discovery(
        &req.ip_range_start,
        &req.ip_range_end,
        req.scan_timeout,
        req.concurrent_scans,
    ) {
        Ok(id) => started(id),
        Err(e) => error_response(e),
    }
}

/// Start a discovery over the configured DHCP range
pub async fn start_dhcp_discovery(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.service.start_dhcp_discovery() {
        Ok(id) => started(id),
        Err(e) => error_response(e),
    }
}

/// Poll a discovery session
pub async fn get_progress(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.service.progress(&id) {
        Ok(session) => Json(session).into_response(),
        Err(e) => error_response(e),
    }
}

/// Request cancellation of a discovery session
pub async fn cancel_discovery(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.service.cancel(&id) {
        Ok(()) => Json(serde_json::json!({
            "status": "cancelling",
            "session_id": id
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

/// Ping one device
pub async fn ping_device(
    State(state): State<Arc<AppState>>,
    Path(ip): Path<String>,
) -> impl IntoResponse {
    match state.service.ping_device(&ip).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(e),
    }
}

/// Device label request body
#[derive(Deserialize)]
pub struct SaveNameRequest {
    /// IPv4 address or MAC of the device
    #[serde(alias = "ip", alias = "mac")]
    pub device: String,
    pub custom_name: Option<String>,
    pub device_type: Option<String>,
}

/// Save an operator label for a device
pub async fn save_device_name(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SaveNameRequest>,
) -> impl IntoResponse {
    info!(device = %req.device, "Saving device name");
    match state
        .service
        .save_device_name(&req.device, req.custom_name, req.device_type)
        .await
    {
        Ok(record) => Json(record).into_response(),
        Err(e) => error_response(e),
    }
}

/// List every cached device
pub async fn list_devices(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.service.cached_devices())
}

/// Read the neighbor table now
pub async fn refresh_arp_table(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.service.refresh_arp_table().await {
        Ok(entries) => Json(serde_json::json!({
            "count": entries.len(),
            "entries": entries
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

/// Drop invalid and duplicate cache records
pub async fn cleanup_cache(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.service.cleanup_cache() {
        Ok(removed) => Json(serde_json::json!({ "removed": removed })).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn cache_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.service.cache_stats())
}

pub async fn get_settings(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.service.network_settings())
}

pub async fn update_settings(
    State(state): State<Arc<AppState>>,
    Json(settings): Json<NetworkSettings>,
) -> impl IntoResponse {
    match state.service.update_network_settings(settings) {
        Ok(updated) => Json(updated).into_response(),
        Err(e) => error_response(e),
    }
}
