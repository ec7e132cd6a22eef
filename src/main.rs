//! Portgate - reverse TCP proxy for devices behind NAT
//!
//! Devices dial in on the discovery port and register; each one is then
//! reachable by local clients on its own proxy port.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use portgate_api::{ApiServer, ApiServerConfig};
use portgate_control::{DeviceRegistry, PortRange};
use portgate_server_tcp::{DiscoveryServer, DiscoveryServerConfig};

/// Portgate - expose registered devices on local TCP ports
#[derive(Parser, Debug)]
#[command(name = "portgate")]
#[command(about = "Expose dial-in devices on local TCP ports", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Listing API bind address
    #[arg(long, env = "PORTGATE_API_ADDR", default_value = "0.0.0.0:7000")]
    api_addr: SocketAddr,

    /// Discovery port devices register on
    #[arg(long, env = "PORTGATE_DISCOVERY_ADDR", default_value = "0.0.0.0:6775")]
    discovery_addr: SocketAddr,

    /// Proxy port range handed out to devices (format: "8990-9000", inclusive)
    #[arg(long, env = "PORTGATE_PORT_RANGE", default_value = "8990-9000")]
    port_range: PortRange,

    /// Host the per-device proxy ports are bound on
    #[arg(long, env = "PORTGATE_PROXY_BIND_HOST", default_value = "0.0.0.0")]
    proxy_bind_host: IpAddr,

    /// Seconds a device may wait for a client before it is dropped
    #[arg(long, env = "PORTGATE_IDLE_TIMEOUT", default_value = "300")]
    idle_timeout: u64,

    /// Seconds a new connection has to send its registration frame
    #[arg(long, env = "PORTGATE_HANDSHAKE_TIMEOUT", default_value = "10")]
    handshake_timeout: u64,

    /// Disable the listing API
    #[arg(long)]
    no_api: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn discovery_config(&self) -> DiscoveryServerConfig {
        DiscoveryServerConfig {
            bind_addr: self.discovery_addr,
            proxy_bind_host: self.proxy_bind_host,
            idle_timeout: Duration::from_secs(self.idle_timeout),
            handshake_timeout: Duration::from_secs(self.handshake_timeout),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    info!("Starting portgate {}", env!("GIT_TAG"));
    info!(
        "Proxy port range: {} ({} ports available)",
        cli.port_range,
        cli.port_range.port_count()
    );
    info!(
        "Idle timeout: {}s, handshake timeout: {}s",
        cli.idle_timeout, cli.handshake_timeout
    );

    let registry = Arc::new(DeviceRegistry::new(cli.port_range));

    let discovery = DiscoveryServer::bind(cli.discovery_config(), registry.clone())
        .await
        .with_context(|| format!("Failed to start discovery server on {}", cli.discovery_addr))?;

    let api_handle = if !cli.no_api {
        let server = ApiServer::new(
            ApiServerConfig {
                bind_addr: cli.api_addr,
            },
            registry.clone(),
        );
        Some(tokio::spawn(async move {
            if let Err(e) = server.start().await {
                error!("Listing API stopped: {}", e);
            }
        }))
    } else {
        info!("Listing API disabled");
        None
    };

    info!("Ready to accept device registrations");
    info!("Press Ctrl+C to stop");

    tokio::select! {
        result = discovery.run() => {
            result.context("Discovery server stopped")?;
        }
        signal = signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Shutdown signal received, stopping servers..."),
                Err(err) => error!("Error listening for shutdown signal: {}", err),
            }
        }
    }

    if let Some(handle) = api_handle {
        handle.abort();
    }
    info!("Portgate stopped");

    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["portgate"]).unwrap();

        assert_eq!(cli.api_addr.to_string(), "0.0.0.0:7000");
        assert_eq!(cli.discovery_addr.to_string(), "0.0.0.0:6775");
        assert_eq!(cli.port_range, PortRange::new(8990, 9000).unwrap());
        assert!(!cli.no_api);

        let config = cli.discovery_config();
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_custom_port_range() {
        let cli = Cli::try_parse_from(["portgate", "--port-range", "20000-20010", "--no-api"])
            .unwrap();

        assert_eq!(cli.port_range.port_count(), 11);
        assert!(cli.no_api);
    }

    #[test]
    fn test_inverted_port_range_is_rejected() {
        assert!(Cli::try_parse_from(["portgate", "--port-range", "9000-8990"]).is_err());
        assert!(Cli::try_parse_from(["portgate", "--port-range", "9000"]).is_err());
    }
}
