//! Monitor agents: bootstrap, quorum state machine, supervision, graceful
//! handover

pub mod agent;
pub mod bootstrap;
pub mod config;
pub mod failover;
pub mod listener;
pub mod quorum;
pub mod supervisor;

pub use agent::{AgentState, MonitorAgent};
pub use bootstrap::{bootstrap, register_peers};
pub use config::MonitorConfig;
pub use failover::{FailoverCoordinator, FailoverRequest};
pub use quorum::{select_replica, FailoverMachine, FailoverState, Verdict};
pub use supervisor::{Supervisor, TickReport};
