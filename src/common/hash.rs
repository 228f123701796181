//! Hashing utilities for kvsentinel
//!
//! Monitor identities are derived from hostnames with BLAKE3 so that a
//! restarted agent keeps the identity its peers already know.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of a monitor identity in bytes (40 hex characters on the wire)
pub const MONITOR_ID_BYTES: usize = 20;

/// Stable identity of a monitor agent. Ordering is used for leader tie-breaks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MonitorId(String);

impl MonitorId {
    /// Derive the identity of the agent running on `hostname`
    pub fn from_hostname(hostname: &str) -> Self {
        let hash = blake3::hash(hostname.as_bytes());
        Self(hex::encode(&hash.as_bytes()[..MONITOR_ID_BYTES]))
    }

    /// Accept an identity received from a peer
    pub fn parse(s: &str) -> crate::Result<Self> {
        if s.len() != MONITOR_ID_BYTES * 2 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(crate::Error::Protocol(format!("invalid monitor id: {}", s)));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MonitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
