//! Discovery server
//!
//! Accepts registration connections from devices, turns each one into a
//! registered device with its own proxy port, and tears it down again when
//! the device goes away.

mod server;

pub use server::{DiscoveryError, DiscoveryServer, DiscoveryServerConfig, SUPERSEDE_TIMEOUT};
