//! Per-device TCP proxy server
//!
//! Each registered device gets its own listener on a dedicated port. Clients
//! accepted there are relayed byte-for-byte over the device's control
//! connection, one session at a time.

pub mod relay;
mod server;

pub use relay::{relay_session, DirectionEnd, SessionSummary, RELAY_BUFFER_SIZE};
pub use server::{DeviceProxyServer, TcpProxyServerConfig, TcpProxyServerError};
