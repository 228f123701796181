//! # kvsentinel
//!
//! Control plane for a replicated key-value cluster (one master, N replicas)
//! supervised by a quorum of monitor agents:
//! - Role resolution at member startup from DNS discovery and the quorum
//! - Monitor agent bootstrap with idempotent peer registration
//! - Quorum-based down detection and automatic failover
//! - Graceful handover when the master is stopping
//! - Liveness/readiness probes
//!
//! ## Architecture
//!
//! ```text
//!   headless service DNS
//!          │
//!   ┌──────▼───────┐   get-master-addr-by-name   ┌──────────────────┐
//!   │ RoleResolver ├────────────────────────────►│  Monitor Quorum  │
//!   └──────┬───────┘                             │ agent 0 │ 1 │ 2  │
//!          │ LaunchPlan                          └────┬─────────────┘
//!   ┌──────▼───────┐   PING / ROLE / REPLICAOF        │
//!   │  data server │◄─────────────────────────────────┘
//!   └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a data member
//! ```bash
//! kvsentinel node start --config /etc/kvsentinel.toml
//! ```
//!
//! ### Start the monitor agent next to it
//! ```bash
//! kvsentinel sentinel start --config /etc/kvsentinel.toml
//! ```
//!
//! ### Lifecycle hooks
//! ```bash
//! kvsentinel sentinel prestop --timeout 20
//! kvsentinel node prestop --timeout 20
//! kvsentinel probe readiness --timeout 5
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod discovery;
pub mod health;
pub mod node;
pub mod probe;
pub mod protocol;
pub mod sentinel;

// Re-export commonly used types
pub use common::{Config, Error, MonitorId, NodeAddr, Result, Role};
pub use discovery::{ClusterView, DnsDirectory, PeerDirectory};
pub use node::{LaunchPlan, RoleDecision, RoleResolver};
pub use sentinel::{FailoverCoordinator, MonitorAgent, MonitorConfig};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
