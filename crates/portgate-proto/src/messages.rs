//! Registration message types

use serde::{Deserialize, Serialize};

/// Header sent by a device when it registers.
///
/// Unknown fields are ignored so devices can send extra metadata without
/// breaking older proxies. A missing `name` registers the device with an
/// empty display name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationHeader {
    /// Human readable device name shown in the listing
    #[serde(default)]
    pub name: String,
}

impl RegistrationHeader {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}
