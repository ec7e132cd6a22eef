//! Relay engine for one client session
//!
//! Two directions run as separate tasks under a session scope derived from
//! the device scope. Whichever direction finishes first cancels the session,
//! which unblocks the other one. A failure on the device side also cancels
//! the device itself.

use portgate_control::Device;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Chunk size used in both relay directions
pub const RELAY_BUFFER_SIZE: usize = 1024;

/// How a relay direction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionEnd {
    /// Only the client session is over
    SessionClosed,
    /// The device side failed and the device has to be torn down
    DeviceFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DirectionReport {
    end: DirectionEnd,
    bytes: u64,
}

/// Result of a finished client session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub bytes_to_device: u64,
    pub bytes_to_client: u64,
    pub device_failed: bool,
}

/// Relay one accepted client over the device's control connection until
/// either side is done. The client socket is closed on return.
pub async fn relay_session(
    device: Arc<Device>,
    client: TcpStream,
    peer_addr: SocketAddr,
) -> SessionSummary {
    let session = device.session_token();
    let (client_read, client_write) = client.into_split();

    debug!(
        "Relaying client {} to device {} ({})",
        peer_addr,
        device.name(),
        device.addr()
    );

    let upstream = tokio::spawn({
        let device = device.clone();
        let session = session.clone();
        async move {
            let report = client_to_device(&device, client_read, &session).await;
            finish_direction(&device, &session, report.end);
            report
        }
    });

    let downstream = tokio::spawn({
        let device = device.clone();
        let session = session.clone();
        async move {
            let report = device_to_client(&device, client_write, &session).await;
            finish_direction(&device, &session, report.end);
            report
        }
    });

    let (upstream, downstream) = tokio::join!(upstream, downstream);
    let upstream = joined_report(upstream, &device, &session);
    let downstream = joined_report(downstream, &device, &session);

    let summary = SessionSummary {
        bytes_to_device: upstream.bytes,
        bytes_to_client: downstream.bytes,
        device_failed: upstream.end == DirectionEnd::DeviceFailed
            || downstream.end == DirectionEnd::DeviceFailed,
    };

    debug!(
        "Client {} done: {} bytes to device, {} bytes to client",
        peer_addr, summary.bytes_to_device, summary.bytes_to_client
    );

    summary
}

fn finish_direction(device: &Device, session: &CancellationToken, end: DirectionEnd) {
    if end == DirectionEnd::DeviceFailed {
        device.cancel();
    }
    session.cancel();
}

fn joined_report(
    joined: Result<DirectionReport, tokio::task::JoinError>,
    device: &Device,
    session: &CancellationToken,
) -> DirectionReport {
    joined.unwrap_or_else(|e| {
        warn!("Relay task for device {} failed: {}", device.addr(), e);
        session.cancel();
        DirectionReport {
            end: DirectionEnd::SessionClosed,
            bytes: 0,
        }
    })
}

async fn client_to_device(
    device: &Device,
    mut client: OwnedReadHalf,
    session: &CancellationToken,
) -> DirectionReport {
    let mut buffer = [0u8; RELAY_BUFFER_SIZE];
    let mut bytes = 0u64;

    let end = loop {
        let n = tokio::select! {
            biased;
            _ = session.cancelled() => break DirectionEnd::SessionClosed,
            read = client.read(&mut buffer) => match read {
                Ok(0) => {
                    debug!("Client closed connection to device {}", device.addr());
                    break DirectionEnd::SessionClosed;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!("Failed to read from client of device {}: {}", device.addr(), e);
                    break DirectionEnd::SessionClosed;
                }
            },
        };

        tokio::select! {
            biased;
            _ = session.cancelled() => break DirectionEnd::SessionClosed,
            written = device.write_all(&buffer[..n]) => {
                if let Err(e) = written {
                    warn!("Failed to forward {} bytes to device {}: {}", n, device.addr(), e);
                    break DirectionEnd::DeviceFailed;
                }
            }
        }

        bytes += n as u64;
    };

    DirectionReport { end, bytes }
}

async fn device_to_client(
    device: &Device,
    mut client: OwnedWriteHalf,
    session: &CancellationToken,
) -> DirectionReport {
    let mut buffer = [0u8; RELAY_BUFFER_SIZE];
    let mut bytes = 0u64;

    let end = loop {
        let n = tokio::select! {
            biased;
            _ = session.cancelled() => break DirectionEnd::SessionClosed,
            read = device.read(&mut buffer) => match read {
                Ok(0) => {
                    info!("Device {} ({}) closed its control connection", device.name(), device.addr());
                    break DirectionEnd::DeviceFailed;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!("Failed to read from device {}: {}", device.addr(), e);
                    break DirectionEnd::DeviceFailed;
                }
            },
        };

        tokio::select! {
            biased;
            _ = session.cancelled() => break DirectionEnd::SessionClosed,
            written = client.write_all(&buffer[..n]) => {
                if let Err(e) = written {
                    debug!("Failed to write to client of device {}: {}", device.addr(), e);
                    break DirectionEnd::SessionClosed;
                }
            }
        }

        bytes += n as u64;
    };

    DirectionReport { end, bytes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    /// Device whose remote end echoes everything back
    async fn echo_device() -> Arc<Device> {
        let (mut remote, local) = connected_pair().await;
        tokio::spawn(async move {
            let (mut r, mut w) = remote.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });
        Arc::new(Device::new(
            local,
            9000,
            "echo",
            "127.0.0.1",
            Duration::from_secs(30),
        ))
    }

    /// Start a relay session; returns the client end and the session handle
    async fn start_session(
        device: Arc<Device>,
    ) -> (TcpStream, tokio::task::JoinHandle<SessionSummary>) {
        let (client, proxied) = connected_pair().await;
        let peer = client.local_addr().unwrap();
        let handle = tokio::spawn(relay_session(device, proxied, peer));
        (client, handle)
    }

    #[tokio::test]
    async fn test_relay_is_byte_exact_across_buffer_sizes() {
        for size in [1usize, 100, RELAY_BUFFER_SIZE, 5 * RELAY_BUFFER_SIZE + 17] {
            let device = echo_device().await;
            let (mut client, session) = start_session(device.clone()).await;

            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            client.write_all(&payload).await.unwrap();

            let mut echoed = vec![0u8; size];
            tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
                .await
                .expect("echo timed out")
                .unwrap();
            assert_eq!(echoed, payload, "payload of {} bytes was altered", size);

            drop(client);
            let summary = tokio::time::timeout(Duration::from_secs(5), session)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(summary.bytes_to_device, size as u64);
            assert!(!summary.device_failed);
            assert!(!device.is_cancelled());
        }
    }

    #[tokio::test]
    async fn test_client_eof_keeps_device_alive() {
        let device = echo_device().await;

        let (client, session) = start_session(device.clone()).await;
        drop(client);
        let summary = tokio::time::timeout(Duration::from_secs(2), session)
            .await
            .unwrap()
            .unwrap();
        assert!(!summary.device_failed);
        assert!(!device.is_cancelled());

        // The same device serves the next client
        let (mut client, _session) = start_session(device.clone()).await;
        client.write_all(b"again").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"again");
    }

    #[tokio::test]
    async fn test_device_eof_tears_down_device_and_client() {
        let (remote, local) = connected_pair().await;
        let device = Arc::new(Device::new(
            local,
            9000,
            "flaky",
            "127.0.0.1",
            Duration::from_secs(30),
        ));

        let (mut client, session) = start_session(device.clone()).await;
        drop(remote);

        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(1), client.read(&mut buf))
            .await
            .expect("client was not closed after device hung up");
        assert!(matches!(read, Ok(0) | Err(_)));

        let summary = session.await.unwrap();
        assert!(summary.device_failed);
        assert!(device.is_cancelled());
    }

    #[tokio::test]
    async fn test_device_cancel_ends_session() {
        let device = echo_device().await;
        let (mut client, session) = start_session(device.clone()).await;

        device.cancel();

        let summary = tokio::time::timeout(Duration::from_secs(1), session)
            .await
            .expect("session ignored device cancellation")
            .unwrap();
        assert!(!summary.device_failed);

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(1), client.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }
}
