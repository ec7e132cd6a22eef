//! Response bodies served by the listing endpoint

use portgate_control::DeviceInfo;
use serde::{Deserialize, Serialize};

/// One registered device as shown to HTTP callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Assigned proxy port, rendered as a decimal string
    pub proxy_port: String,
    pub device_name: String,
    pub device_addr: String,
}

impl From<DeviceInfo> for DeviceEntry {
    fn from(info: DeviceInfo) -> Self {
        Self {
            proxy_port: info.proxy_port.to_string(),
            device_name: info.name,
            device_addr: info.addr,
        }
    }
}

/// Listing of all registered devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceList {
    pub devices: Vec<DeviceEntry>,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Registered device count
    pub active_devices: usize,
    /// Ports still free in the pool
    pub free_ports: usize,
}
