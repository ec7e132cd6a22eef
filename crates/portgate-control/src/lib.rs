//! Control plane for registered devices
//!
//! Port pool, device registry and the device record that owns a control
//! connection.

pub mod device;
pub mod port_pool;
pub mod registry;

pub use device::{Device, DeviceInfo};
pub use port_pool::{PortPool, PortPoolError, PortRange, PortRangeError};
pub use registry::DeviceRegistry;
