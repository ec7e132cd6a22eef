//! Discovery server implementation

use portgate_control::{Device, DeviceRegistry, PortPoolError};
use portgate_proto::{CodecError, RegistrationCodec};
use portgate_server_tcp_proxy::{DeviceProxyServer, TcpProxyServerConfig, TcpProxyServerError};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Upper bound on waiting for a superseded device to finish its teardown
pub const SUPERSEDE_TIMEOUT: Duration = Duration::from_secs(5);

/// Discovery server errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Registration handshake failed: {0}")]
    Handshake(#[from] CodecError),

    #[error("Registration handshake not completed within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Failed to reserve proxy port: {0}")]
    PortPool(#[from] PortPoolError),

    #[error("Device proxy stopped: {0}")]
    Proxy(#[from] TcpProxyServerError),
}

/// Discovery server configuration
#[derive(Debug, Clone)]
pub struct DiscoveryServerConfig {
    /// Address devices register on
    pub bind_addr: SocketAddr,
    /// Host the per-device proxy ports are bound on
    pub proxy_bind_host: IpAddr,
    /// How long a device may sit without a client before it is torn down
    pub idle_timeout: Duration,
    /// How long a device has to deliver its registration frame
    pub handshake_timeout: Duration,
}

impl Default for DiscoveryServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 6775),
            proxy_bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            idle_timeout: Duration::from_secs(300),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Accepts device registrations
pub struct DiscoveryServer {
    config: DiscoveryServerConfig,
    registry: Arc<DeviceRegistry>,
    listener: TcpListener,
}

impl DiscoveryServer {
    /// Bind the discovery port
    pub async fn bind(
        config: DiscoveryServerConfig,
        registry: Arc<DeviceRegistry>,
    ) -> Result<Self, DiscoveryError> {
        let listener = TcpListener::bind(config.bind_addr).await.map_err(|e| {
            DiscoveryError::BindError {
                address: config.bind_addr.ip().to_string(),
                port: config.bind_addr.port(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            config,
            registry,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DiscoveryError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept registrations forever, one task per connection
    pub async fn run(self) -> Result<(), DiscoveryError> {
        info!("Discovery server listening on {}", self.local_addr()?);

        loop {
            match self.listener.accept().await {
                Ok((socket, peer_addr)) => {
                    debug!("Accepted registration connection from {}", peer_addr);
                    let registry = self.registry.clone();
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            Self::handle_registration(socket, peer_addr, registry, config).await
                        {
                            warn!("Registration from {} ended: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept registration connection: {}", e);
                }
            }
        }
    }

    /// Run one device from handshake to teardown.
    ///
    /// Any error before the device exists drops the connection, which closes
    /// it. Once the device exists, teardown always runs.
    async fn handle_registration(
        mut socket: TcpStream,
        peer_addr: SocketAddr,
        registry: Arc<DeviceRegistry>,
        config: DiscoveryServerConfig,
    ) -> Result<(), DiscoveryError> {
        let header = tokio::time::timeout(
            config.handshake_timeout,
            RegistrationCodec::read_from(&mut socket),
        )
        .await
        .map_err(|_| DiscoveryError::HandshakeTimeout(config.handshake_timeout))??;

        let addr = peer_addr.ip().to_string();
        let port = registry.reserve_port()?;

        if let Some(stale) = registry.get(&addr).await {
            info!(
                "Device at {} re-registered, superseding {} on port {}",
                addr,
                stale.name(),
                stale.proxy_port()
            );
            if tokio::time::timeout(SUPERSEDE_TIMEOUT, stale.shutdown())
                .await
                .is_err()
            {
                warn!(
                    "Superseded device {} did not finish teardown within {:?}",
                    addr, SUPERSEDE_TIMEOUT
                );
            }
        }

        let device = Arc::new(Device::new(
            socket,
            port,
            header.name,
            addr.clone(),
            config.idle_timeout,
        ));

        // A concurrent registration from the same address may have slipped in
        if let Some(previous) = registry.add(addr, device.clone()).await {
            previous.cancel();
        }

        let proxy_config = TcpProxyServerConfig::for_device(config.proxy_bind_host, &device);
        let result = DeviceProxyServer::new(proxy_config, device.clone())
            .run()
            .await;

        registry.teardown(&device).await;

        result.map_err(DiscoveryError::from)
    }
}
