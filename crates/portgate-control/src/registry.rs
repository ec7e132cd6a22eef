//! Device registry keyed by device address
//!
//! Holds at most one live device per address and owns the port pool the
//! devices draw their proxy ports from. The registry lock is never held
//! across device I/O.

use crate::device::{Device, DeviceInfo};
use crate::port_pool::{PortPool, PortPoolError, PortRange};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Arc<Device>>>,
    pool: PortPool,
}

impl DeviceRegistry {
    pub fn new(port_range: PortRange) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            pool: PortPool::new(port_range),
        }
    }

    pub fn pool(&self) -> &PortPool {
        &self.pool
    }

    pub fn reserve_port(&self) -> Result<u16, PortPoolError> {
        self.pool.reserve()
    }

    pub fn release_port(&self, port: u16) {
        self.pool.release(port);
    }

    /// Get the device registered under an address
    pub async fn get(&self, addr: &str) -> Option<Arc<Device>> {
        self.devices.read().await.get(addr).cloned()
    }

    /// Snapshot of all registered devices, ordered by proxy port
    pub async fn list(&self) -> Vec<DeviceInfo> {
        let mut devices: Vec<DeviceInfo> = self
            .devices
            .read()
            .await
            .values()
            .map(|device| device.info())
            .collect();
        devices.sort_by_key(|device| device.proxy_port);
        devices
    }

    /// Register a device, replacing whatever was registered under `addr`.
    ///
    /// The caller is responsible for having torn down the previous device.
    pub async fn add(&self, addr: String, device: Arc<Device>) -> Option<Arc<Device>> {
        info!(
            "Registering device {} ({}) on port {}",
            device.name(),
            addr,
            device.proxy_port()
        );
        self.devices.write().await.insert(addr, device)
    }

    /// Remove whatever is registered under `addr`
    pub async fn remove(&self, addr: &str) -> Option<Arc<Device>> {
        self.devices.write().await.remove(addr)
    }

    /// Remove the entry for `device`'s address only if it still points at
    /// that same device. A superseded device never evicts its replacement.
    pub async fn remove_device(&self, device: &Device) -> bool {
        let mut devices = self.devices.write().await;
        match devices.get(device.addr()) {
            Some(current) if current.id() == device.id() => {
                devices.remove(device.addr());
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    /// Full teardown of a device: close its connection, cancel its scope,
    /// deregister it and release its port. Runs at most once per device.
    pub async fn teardown(&self, device: &Device) {
        if !device.begin_teardown() {
            debug!("Teardown of device {} already in progress", device.addr());
            return;
        }

        device.close().await;

        if !self.remove_device(device).await {
            debug!(
                "Device {} was already replaced in the registry",
                device.addr()
            );
        }
        self.release_port(device.proxy_port());
        device.mark_closed();

        info!(
            "Device {} ({}) torn down, port {} released",
            device.name(),
            device.addr(),
            device.proxy_port()
        );
    }
}
