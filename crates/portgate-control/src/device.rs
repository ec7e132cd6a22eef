//! A registered device and its shared control connection
//!
//! The control connection is split into halves that are each guarded by their
//! own lock: relay directions may read and write concurrently, but two reads
//! (or two writes) never interleave. Cancelling the device scope closes the
//! connection and every client session derived from it.

use chrono::{DateTime, Utc};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

/// Point-in-time view of a device, safe to hand out to readers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: Uuid,
    pub name: String,
    pub addr: String,
    pub proxy_port: u16,
    pub connected_at: DateTime<Utc>,
}

pub struct Device {
    id: Uuid,
    name: String,
    addr: String,
    proxy_port: u16,
    idle_timeout: Duration,
    connected_at: DateTime<Utc>,

    cancel: CancellationToken,
    closed_tx: watch::Sender<bool>,
    torn_down: AtomicBool,

    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl Device {
    pub fn new(
        conn: TcpStream,
        proxy_port: u16,
        name: impl Into<String>,
        addr: impl Into<String>,
        idle_timeout: Duration,
    ) -> Self {
        let (reader, writer) = conn.into_split();
        let (closed_tx, _) = watch::channel(false);

        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            addr: addr.into(),
            proxy_port,
            idle_timeout,
            connected_at: Utc::now(),
            cancel: CancellationToken::new(),
            closed_tx,
            torn_down: AtomicBool::new(false),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source address of the device, used as its registry key
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn proxy_port(&self) -> u16 {
        self.proxy_port
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.id,
            name: self.name.clone(),
            addr: self.addr.clone(),
            proxy_port: self.proxy_port,
            connected_at: self.connected_at,
        }
    }

    /// Device-wide cancellation scope
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// New client session scope, cancelled together with the device
    pub fn session_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Cancel the device scope. Listeners and sessions observe it and exit.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            debug!("Cancelling device {} ({})", self.name, self.addr);
        }
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Read from the control connection while holding the read lock
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reader = self.reader.lock().await;
        let reader = reader.as_mut().ok_or_else(connection_closed)?;
        let n = reader.read(buf).await?;
        trace!("Read {} bytes from device {}", n, self.addr);
        Ok(n)
    }

    /// Write a whole chunk to the control connection while holding the write lock
    pub async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or_else(connection_closed)?;
        writer.write_all(buf).await?;
        writer.flush().await?;
        trace!("Wrote {} bytes to device {}", buf.len(), self.addr);
        Ok(())
    }

    /// Cancel the scope and close the control connection.
    ///
    /// Waits for in-flight relay I/O to let go of the connection locks; relays
    /// select on the (already cancelled) scope so this is prompt.
    pub async fn close(&self) {
        self.cancel();

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.reader.lock().await.take();

        debug!("Closed control connection of device {}", self.addr);
    }

    /// Claim the one-shot teardown. Returns false if it was already claimed.
    pub fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::AcqRel)
    }

    /// Signal that teardown finished (connection closed, deregistered, port released)
    pub fn mark_closed(&self) {
        self.closed_tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Wait until teardown has finished
    pub async fn wait_closed(&self) {
        let mut closed_rx = self.closed_tx.subscribe();
        // The sender lives in self, so the channel cannot close under us
        let _ = closed_rx.wait_for(|closed| *closed).await;
    }

    /// Cancel the device and wait for its owner to finish tearing it down
    pub async fn shutdown(&self) {
        self.cancel();
        self.wait_closed().await;
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("proxy_port", &self.proxy_port)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

fn connection_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "device connection closed")
}
