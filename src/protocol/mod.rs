//! Wire protocols spoken by the control plane
//!
//! - `resp`: RESP2 framing and connections
//! - `node`: data-plane client (`PING`, `ROLE`, `REPLICAOF`)
//! - `sentinel`: monitor protocol client (`SENTINEL ...`)
//!
//! The traits below are the seams between the control logic and the network,
//! so the role resolver, supervisor and failover coordinator can be driven by
//! in-memory implementations in tests.

pub mod node;
pub mod resp;
pub mod sentinel;

use crate::common::{MonitorId, NodeAddr, Result, Role};
use async_trait::async_trait;

pub use node::RespDataPlane;
pub use resp::{Connection, Frame};
pub use sentinel::{RespPeerChannel, SentinelClient};

/// Reply to a `PING` sent to a data node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingReply {
    Pong,
    /// The node is alive but still loading its dataset
    Loading,
    Other(String),
}

/// Replication status from a `ROLE` reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationInfo {
    pub role: Role,
    /// Replication offset processed by this node
    pub offset: u64,
    /// Master this node replicates from (replicas only)
    pub master: Option<NodeAddr>,
    /// Replica link state is `connected`
    pub link_up: bool,
}

/// Who-is-master queries and the manual failover trigger
#[async_trait]
pub trait MonitorQuorum: Send + Sync {
    /// Current master of `name`, or `None` when the quorum knows none yet
    async fn master_addr(&self, name: &str) -> Result<Option<NodeAddr>>;

    /// Ask the quorum to fail `name` over to a replica
    async fn failover(&self, name: &str) -> Result<()>;
}

/// Commands sent to data-serving members
#[async_trait]
pub trait DataPlane: Send + Sync {
    async fn ping(&self, node: &NodeAddr) -> Result<PingReply>;

    async fn role(&self, node: &NodeAddr) -> Result<ReplicationInfo>;

    /// `REPLICAOF NO ONE`
    async fn promote(&self, node: &NodeAddr) -> Result<()>;

    /// `REPLICAOF <host> <port>`
    async fn replicate_from(&self, node: &NodeAddr, master: &NodeAddr) -> Result<()>;
}

/// What an agent asks its peers each supervision tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpinionQuery {
    pub name: String,
    pub master: NodeAddr,
    pub epoch: u64,
    pub requester: MonitorId,
}

/// A peer's answer: is the master down from where it stands, and what does
/// it believe the current configuration is
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerOpinion {
    pub down: bool,
    pub epoch: u64,
    pub master: Option<NodeAddr>,
}

/// Agent-to-agent exchange
#[async_trait]
pub trait PeerChannel: Send + Sync {
    async fn opinion(&self, peer: &NodeAddr, query: &OpinionQuery) -> Result<PeerOpinion>;
}
