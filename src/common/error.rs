//! Error types for kvsentinel

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Startup Errors ===
    #[error("Discovery unavailable: {address} not visible in {service} after {attempts} attempts")]
    DiscoveryUnavailable {
        service: String,
        address: String,
        attempts: usize,
    },

    #[error("Master unknown: quorum reported no master for {name} after {attempts} attempts")]
    MasterUnknown { name: String, attempts: usize },

    // === Shutdown Errors ===
    #[error("Failover of {name} did not complete within {waited:?}")]
    FailoverTimedOut { name: String, waited: Duration },

    // === Protocol Errors ===
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server replied with error: {0}")]
    Server(String),

    // === Network Errors ===
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config source error: {0}")]
    Config(#[from] config::ConfigError),

    // === Generic ===
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a transient error worth retrying locally?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Timeout(_) | Error::ConnectionFailed(_) | Error::Server(_)
        )
    }

    /// Errors that abort a member's startup hook.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            Error::DiscoveryUnavailable { .. } | Error::MasterUnknown { .. } | Error::InvalidConfig(_)
        )
    }

    /// Server error replies that signal the dataset is still loading.
    pub fn is_loading(&self) -> bool {
        matches!(self, Error::Server(msg) if msg.starts_with("LOADING"))
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
