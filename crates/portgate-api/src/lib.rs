//! HTTP listing of registered devices

pub mod handlers;
pub mod models;

use axum::{routing::get, Router};
use portgate_control::DeviceRegistry;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
pub struct AppState {
    pub registry: Arc<DeviceRegistry>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Failed to bind API server to {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("API server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7000),
        }
    }
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, registry: Arc<DeviceRegistry>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { registry }),
        }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/", get(handlers::list_devices))
            .route("/api/devices", get(handlers::list_devices))
            .route("/api/health", get(handlers::health_check))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Start the API server
    pub async fn start(self) -> Result<(), ApiError> {
        let router = self.build_router();

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|source| ApiError::Bind {
                address: self.config.bind_addr,
                source,
            })?;

        info!("Starting API server on {}", self.config.bind_addr);

        axum::serve(listener, router).await.map_err(ApiError::Serve)
    }
}
