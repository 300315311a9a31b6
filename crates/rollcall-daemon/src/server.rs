//! Web server setup and routing

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api;
use crate::state::AppState;

/// Build the API router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Discovery sessions
        .route("/api/discovery/static", post(api::start_static_discovery))
        .route("/api/discovery/dhcp", post(api::start_dhcp_discovery))
        .route("/api/discovery/{id}", get(api::get_progress))
        .route("/api/discovery/{id}/cancel", post(api::cancel_discovery))
        // Devices
        .route("/api/devices", get(api::list_devices))
        .route("/api/devices/ping/{ip}", get(api::ping_device))
        .route("/api/devices/name", post(api::save_device_name))
        .route("/api/arp", get(api::refresh_arp_table))
        // Cache maintenance
        .route("/api/cache/cleanup", post(api::cleanup_cache))
        .route("/api/cache/stats", get(api::cache_stats))
        // Network settings
        .route("/api/settings", get(api::get_settings).put(api::update_settings))
        // CORS
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the API server until it fails
pub async fn run(state: Arc<AppState>, bind: &str) -> Result<()> {
    let discovery = &state.config.discovery;
    state
        .service
        .spawn_session_reaper(discovery.session_retention(), discovery.reaper_interval());

    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(address = %bind, protocol = "HTTP", "Starting API server");
    axum::serve(listener, app).await?;
    Ok(())
}
