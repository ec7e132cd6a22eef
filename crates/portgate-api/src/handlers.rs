use axum::{extract::State, Json};
use std::sync::Arc;
use tracing::debug;

use crate::models::*;
use crate::AppState;

/// List all registered devices, ordered by proxy port
pub async fn list_devices(State(state): State<Arc<AppState>>) -> Json<DeviceList> {
    debug!("Listing devices");

    let devices = state
        .registry
        .list()
        .await
        .into_iter()
        .map(DeviceEntry::from)
        .collect();

    Json(DeviceList { devices })
}

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let pool = state.registry.pool();
    let free_ports = pool.range().port_count().saturating_sub(pool.reserved_count());

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_devices: state.registry.len().await,
        free_ports,
    })
}
