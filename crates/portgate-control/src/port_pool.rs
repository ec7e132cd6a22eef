//! Port pool for per-device proxy listeners
//!
//! Ports are handed out lowest-first from a fixed inclusive range. Entries are
//! never removed from the map, a release only flips the flag back to free.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortPoolError {
    #[error("No port available in range {first}-{last}")]
    NoPortAvailable { first: u16, last: u16 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortRangeError {
    #[error("Invalid port range format '{0}'. Expected: START-END (e.g., 8990-9000)")]
    InvalidFormat(String),

    #[error("Invalid port '{0}'")]
    InvalidPort(String),

    #[error("Start port {start} > end port {end}")]
    Inverted { start: u16, end: u16 },
}

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, PortRangeError> {
        if start > end {
            return Err(PortRangeError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    /// Number of ports in the range
    pub fn port_count(&self) -> usize {
        (self.end - self.start) as usize + 1
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl std::str::FromStr for PortRange {
    type Err = PortRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| PortRangeError::InvalidFormat(s.to_string()))?;
        let start = start
            .trim()
            .parse::<u16>()
            .map_err(|_| PortRangeError::InvalidPort(start.trim().to_string()))?;
        let end = end
            .trim()
            .parse::<u16>()
            .map_err(|_| PortRangeError::InvalidPort(end.trim().to_string()))?;
        PortRange::new(start, end)
    }
}

/// Tracks which ports of a range are handed out
pub struct PortPool {
    range: PortRange,
    /// port -> reserved flag; absent means free
    ports: Mutex<HashMap<u16, bool>>,
}

impl PortPool {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            ports: Mutex::new(HashMap::with_capacity(range.port_count())),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Reserve the lowest free port in the range
    pub fn reserve(&self) -> Result<u16, PortPoolError> {
        let mut ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);

        for port in self.range.start..=self.range.end {
            let reserved = ports.entry(port).or_insert(false);
            if !*reserved {
                *reserved = true;
                debug!("Reserved port {}", port);
                return Ok(port);
            }
        }

        Err(PortPoolError::NoPortAvailable {
            first: self.range.start,
            last: self.range.end,
        })
    }

    /// Mark a port free again. Releasing a free or foreign port is a no-op.
    pub fn release(&self, port: u16) {
        let mut ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(reserved) = ports.get_mut(&port) {
            if *reserved {
                debug!("Released port {}", port);
            }
            *reserved = false;
        } else {
            trace!("Ignoring release of untracked port {}", port);
        }
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        let ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        ports.get(&port).copied().unwrap_or(false)
    }

    pub fn reserved_count(&self) -> usize {
        let ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        ports.values().filter(|reserved| **reserved).count()
    }
}
