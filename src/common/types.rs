//! Shared cluster types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Replication role of a data-serving member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Replica,
    Unknown,
}

impl Role {
    /// Parse the first element of a `ROLE` reply
    pub fn from_wire(s: &str) -> Self {
        match s {
            "master" => Role::Master,
            "slave" | "replica" => Role::Replica,
            _ => Role::Unknown,
        }
    }

    pub fn is_master(&self) -> bool {
        matches!(self, Role::Master)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Replica => write!(f, "replica"),
            Role::Unknown => write!(f, "unknown"),
        }
    }
}

/// Host and port of a member or monitor agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host port` as returned by `get-master-addr-by-name`
    pub fn from_parts(host: &str, port: &str) -> crate::Result<Self> {
        let port = port
            .parse()
            .map_err(|_| crate::Error::Protocol(format!("invalid port: {}", port)))?;
        Ok(Self::new(host, port))
    }

    /// Hosts compare case-insensitively, ignoring a trailing root dot
    pub fn same_host(&self, host: &str) -> bool {
        self.host
            .trim_end_matches('.')
            .eq_ignore_ascii_case(host.trim_end_matches('.'))
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
