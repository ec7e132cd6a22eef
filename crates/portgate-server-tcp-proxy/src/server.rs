//! Device proxy listener
//!
//! Listens on the device's assigned port and serves one client at a time.
//! The loop ends when the device is cancelled, or with an error when no
//! client shows up within the device's idle timeout.

use crate::relay::relay_session;
use portgate_control::Device;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TcpProxyServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different port range")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Idle timeout of {timeout:?} exceeded for device {device}")]
    IdleTimeout { device: String, timeout: Duration },
}

#[derive(Debug, Clone)]
pub struct TcpProxyServerConfig {
    pub bind_addr: SocketAddr,
    /// How long to wait for a client before giving up on the device
    pub idle_timeout: Duration,
}

impl TcpProxyServerConfig {
    pub fn for_device(bind_host: IpAddr, device: &Device) -> Self {
        Self {
            bind_addr: SocketAddr::new(bind_host, device.proxy_port()),
            idle_timeout: device.idle_timeout(),
        }
    }
}

pub struct DeviceProxyServer {
    config: TcpProxyServerConfig,
    device: Arc<Device>,
}

impl DeviceProxyServer {
    pub fn new(config: TcpProxyServerConfig, device: Arc<Device>) -> Self {
        Self { config, device }
    }

    async fn bind_with_retry(&self) -> Result<TcpListener, TcpProxyServerError> {
        // A freshly released port can still be held by the previous listener
        for attempt in 1..=3 {
            match TcpListener::bind(self.config.bind_addr).await {
                Ok(listener) => {
                    if attempt > 1 {
                        info!(
                            "Successfully bound to {} on attempt {}/3",
                            self.config.bind_addr, attempt
                        );
                    }
                    return Ok(listener);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < 3 => {
                    warn!(
                        "Port {} is in use (attempt {}/3), retrying in 1 second...",
                        self.config.bind_addr.port(),
                        attempt
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => return Err(self.bind_error(e.to_string())),
            }
        }

        Err(self.bind_error("Address in use after 3 retry attempts".to_string()))
    }

    fn bind_error(&self, reason: String) -> TcpProxyServerError {
        TcpProxyServerError::BindError {
            address: self.config.bind_addr.ip().to_string(),
            port: self.config.bind_addr.port(),
            reason,
        }
    }

    /// Serve clients until the device is cancelled or goes idle
    pub async fn run(self) -> Result<(), TcpProxyServerError> {
        let listener = self.bind_with_retry().await?;
        let cancel = self.device.cancellation_token().clone();

        info!(
            "Proxy for device {} ({}) listening on {}",
            self.device.name(),
            self.device.addr(),
            listener.local_addr()?
        );

        loop {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Proxy listener for device {} cancelled", self.device.addr());
                    return Ok(());
                }
                accepted = tokio::time::timeout(self.config.idle_timeout, listener.accept()) => accepted,
            };

            let (stream, peer_addr) = match accepted {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    return Err(TcpProxyServerError::IdleTimeout {
                        device: self.device.name().to_string(),
                        timeout: self.config.idle_timeout,
                    })
                }
            };

            info!(
                "Client {} connected to device {} ({})",
                peer_addr,
                self.device.name(),
                self.device.addr()
            );

            // Sessions are served one at a time
            let summary = relay_session(self.device.clone(), stream, peer_addr).await;
            if summary.device_failed {
                warn!(
                    "Device {} ({}) failed during session with {}",
                    self.device.name(),
                    self.device.addr(),
                    peer_addr
                );
            }
        }
    }
}
