//! In-memory fakes shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use kvsentinel::common::{ClusterConfig, RetryConfig, SentinelSettings};
use kvsentinel::discovery::PeerDirectory;
use kvsentinel::protocol::{
    DataPlane, MonitorQuorum, OpinionQuery, PeerChannel, PeerOpinion, PingReply, ReplicationInfo,
};
use kvsentinel::sentinel::{bootstrap, AgentState, MonitorAgent};
use kvsentinel::{Error, NodeAddr, Result, Role};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const NAME: &str = "mymaster";

pub fn cluster(size: usize) -> ClusterConfig {
    ClusterConfig {
        size,
        ..Default::default()
    }
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        dns_attempts: 5,
        dns_delay_ms: 100,
        master_attempts: 5,
        master_delay_ms: 100,
        max_delay_ms: 400,
        prestop_timeout_secs: 20,
        poll_interval_ms: 1_000,
        command_timeout_ms: 500,
    }
}

pub fn settings(quorum: usize) -> SentinelSettings {
    SentinelSettings {
        quorum,
        down_after_ms: 1_000,
        failover_timeout_ms: 5_000,
        parallel_syncs: 1,
        tick_ms: 250,
        reconcile_interval_ms: 1_000,
    }
}

pub fn ip(ordinal: usize) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 10 + ordinal as u8))
}

pub fn hostname(cluster: &ClusterConfig, ordinal: usize) -> String {
    cluster.member_hostname(ordinal)
}

pub fn data_addr(cluster: &ClusterConfig, ordinal: usize) -> NodeAddr {
    NodeAddr::new(
        cluster.full_hostname(&cluster.member_hostname(ordinal)),
        cluster.data_port,
    )
}

pub fn sentinel_addr(cluster: &ClusterConfig, ordinal: usize) -> NodeAddr {
    NodeAddr::new(
        cluster.full_hostname(&cluster.member_hostname(ordinal)),
        cluster.sentinel_port,
    )
}

// Directory

/// Static name table standing in for cluster DNS
#[derive(Default)]
pub struct StaticDirectory {
    services: Mutex<HashMap<String, Vec<IpAddr>>>,
    hosts: Mutex<HashMap<String, IpAddr>>,
    service_lookups: AtomicUsize,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Members `ordinals` published both by hostname and under the headless
    /// service
    pub fn with_members(cluster: &ClusterConfig, ordinals: &[usize]) -> Arc<Self> {
        let directory = Arc::new(Self::new());
        for &ordinal in ordinals {
            directory.publish(cluster, ordinal);
        }
        directory
    }

    pub fn publish(&self, cluster: &ClusterConfig, ordinal: usize) {
        self.add_host(&cluster.full_hostname(&cluster.member_hostname(ordinal)), ip(ordinal));
        self.services
            .lock()
            .unwrap()
            .entry(cluster.headless_service.clone())
            .or_default()
            .push(ip(ordinal));
    }

    pub fn add_host(&self, host: &str, addr: IpAddr) {
        self.hosts
            .lock()
            .unwrap()
            .insert(host.to_ascii_lowercase(), addr);
    }

    pub fn set_service(&self, service: &str, addrs: Vec<IpAddr>) {
        self.services
            .lock()
            .unwrap()
            .insert(service.to_string(), addrs);
    }

    pub fn service_lookups(&self) -> usize {
        self.service_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerDirectory for StaticDirectory {
    async fn resolve(&self, service: &str) -> Result<Vec<IpAddr>> {
        self.service_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .services
            .lock()
            .unwrap()
            .get(service)
            .cloned()
            .unwrap_or_default())
    }

    async fn resolve_host(&self, hostname: &str) -> Result<Option<IpAddr>> {
        Ok(self
            .hosts
            .lock()
            .unwrap()
            .get(&hostname.to_ascii_lowercase())
            .copied())
    }
}

// Quorum

/// Scripted quorum: queued answers first, then a fixed one
pub struct FakeQuorum {
    answers: Mutex<VecDeque<Option<NodeAddr>>>,
    fallback: Mutex<Option<NodeAddr>>,
    queries: AtomicUsize,
    failovers: AtomicUsize,
}

impl FakeQuorum {
    pub fn new(master: Option<NodeAddr>) -> Arc<Self> {
        Self::scripted(Vec::new(), master)
    }

    pub fn scripted(answers: Vec<Option<NodeAddr>>, then: Option<NodeAddr>) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.into()),
            fallback: Mutex::new(then),
            queries: AtomicUsize::new(0),
            failovers: AtomicUsize::new(0),
        })
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn failovers(&self) -> usize {
        self.failovers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MonitorQuorum for FakeQuorum {
    async fn master_addr(&self, _name: &str) -> Result<Option<NodeAddr>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(answer) = self.answers.lock().unwrap().pop_front() {
            return Ok(answer);
        }
        Ok(self.fallback.lock().unwrap().clone())
    }

    async fn failover(&self, _name: &str) -> Result<()> {
        self.failovers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// Data plane

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeNode {
    pub up: bool,
    pub loading: bool,
    pub role: Role,
    pub offset: u64,
    pub master: Option<NodeAddr>,
}

impl FakeNode {
    pub fn master() -> Self {
        Self {
            up: true,
            loading: false,
            role: Role::Master,
            offset: 0,
            master: None,
        }
    }

    pub fn replica_of(master: NodeAddr, offset: u64) -> Self {
        Self {
            up: true,
            loading: false,
            role: Role::Replica,
            offset,
            master: Some(master),
        }
    }
}

/// Every data server of a test cluster
pub type Nodes = Arc<Mutex<BTreeMap<NodeAddr, FakeNode>>>;

/// One agent's view of the shared data servers. Blocked nodes look
/// unreachable from this view only.
pub struct InMemoryDataPlane {
    nodes: Nodes,
    blocked: Mutex<HashSet<NodeAddr>>,
}

impl InMemoryDataPlane {
    pub fn new(nodes: Nodes) -> Self {
        Self {
            nodes,
            blocked: Mutex::new(HashSet::new()),
        }
    }

    pub fn block(&self, node: &NodeAddr) {
        self.blocked.lock().unwrap().insert(node.clone());
    }

    pub fn unblock(&self, node: &NodeAddr) {
        self.blocked.lock().unwrap().remove(node);
    }

    fn with_node<R>(&self, node: &NodeAddr, f: impl FnOnce(&mut FakeNode) -> R) -> Result<R> {
        if self.blocked.lock().unwrap().contains(node) {
            return Err(Error::ConnectionFailed(format!("{} unreachable", node)));
        }
        let mut nodes = self.nodes.lock().unwrap();
        match nodes.get_mut(node) {
            Some(n) if n.up => Ok(f(n)),
            _ => Err(Error::ConnectionFailed(format!("{} refused", node))),
        }
    }
}

#[async_trait]
impl DataPlane for InMemoryDataPlane {
    async fn ping(&self, node: &NodeAddr) -> Result<PingReply> {
        self.with_node(node, |n| {
            if n.loading {
                PingReply::Loading
            } else {
                PingReply::Pong
            }
        })
    }

    async fn role(&self, node: &NodeAddr) -> Result<ReplicationInfo> {
        self.with_node(node, |n| ReplicationInfo {
            role: n.role,
            offset: n.offset,
            master: n.master.clone(),
            link_up: n.master.is_some(),
        })
    }

    async fn promote(&self, node: &NodeAddr) -> Result<()> {
        self.with_node(node, |n| {
            n.role = Role::Master;
            n.master = None;
        })
    }

    async fn replicate_from(&self, node: &NodeAddr, master: &NodeAddr) -> Result<()> {
        self.with_node(node, |n| {
            n.role = Role::Replica;
            n.master = Some(master.clone());
        })
    }
}

// Peer channel

/// Routes opinion queries straight to the peer agent's state
#[derive(Default)]
pub struct InMemoryPeers {
    agents: Mutex<HashMap<NodeAddr, Arc<AgentState>>>,
}

impl InMemoryPeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, addr: NodeAddr, state: Arc<AgentState>) {
        self.agents.lock().unwrap().insert(addr, state);
    }
}

#[async_trait]
impl PeerChannel for InMemoryPeers {
    async fn opinion(&self, peer: &NodeAddr, query: &OpinionQuery) -> Result<PeerOpinion> {
        let state = self.agents.lock().unwrap().get(peer).cloned();
        match state {
            Some(state) => Ok(state.opinion_for(query)),
            None => Err(Error::ConnectionFailed(format!("no agent at {}", peer))),
        }
    }
}

// Fleet

/// A cluster of members, each with its data server and monitor agent
pub struct Fleet {
    pub cluster: ClusterConfig,
    pub directory: Arc<StaticDirectory>,
    pub nodes: Nodes,
    pub views: Vec<Arc<InMemoryDataPlane>>,
    pub agents: Vec<Arc<MonitorAgent>>,
}

impl Fleet {
    /// Master at ordinal 0, replica `i` at replication offset `offsets[i]`
    pub async fn with_master(size: usize, quorum: usize, offsets: &[u64]) -> Self {
        let cluster = cluster(size);
        let master = data_addr(&cluster, 0);
        let mut nodes = BTreeMap::new();
        nodes.insert(master.clone(), FakeNode::master());
        for ordinal in 1..size {
            let offset = offsets.get(ordinal).copied().unwrap_or_default();
            nodes.insert(
                data_addr(&cluster, ordinal),
                FakeNode::replica_of(master.clone(), offset),
            );
        }
        let directory = StaticDirectory::with_members(&cluster, &(0..size).collect::<Vec<_>>());
        let masters = vec![master; size];
        Self::assemble(cluster, quorum, directory, nodes, masters).await
    }

    /// Every member booted alone and monitors itself; discovery is empty
    pub async fn independent(size: usize, quorum: usize) -> Self {
        let cluster = cluster(size);
        let masters: Vec<NodeAddr> = (0..size).map(|i| data_addr(&cluster, i)).collect();
        let nodes = masters
            .iter()
            .map(|addr| (addr.clone(), FakeNode::master()))
            .collect();
        let directory = Arc::new(StaticDirectory::new());
        Self::assemble(cluster, quorum, directory, nodes, masters).await
    }

    async fn assemble(
        cluster: ClusterConfig,
        quorum: usize,
        directory: Arc<StaticDirectory>,
        nodes: BTreeMap<NodeAddr, FakeNode>,
        masters: Vec<NodeAddr>,
    ) -> Self {
        let nodes: Nodes = Arc::new(Mutex::new(nodes));
        let network = Arc::new(InMemoryPeers::new());
        let settings = settings(quorum);
        let mut views = Vec::new();
        let mut agents = Vec::new();
        for (ordinal, master) in masters.into_iter().enumerate() {
            let hostname = hostname(&cluster, ordinal);
            let config = bootstrap(
                &cluster,
                &settings,
                directory.as_ref(),
                &hostname,
                master,
                None,
            )
            .await
            .unwrap();
            let view = Arc::new(InMemoryDataPlane::new(nodes.clone()));
            let agent = Arc::new(MonitorAgent::new(
                config,
                cluster.clone(),
                hostname,
                directory.clone(),
                view.clone(),
                network.clone(),
            ));
            network.register(sentinel_addr(&cluster, ordinal), agent.state());
            views.push(view);
            agents.push(agent);
        }
        Self {
            cluster,
            directory,
            nodes,
            views,
            agents,
        }
    }

    pub fn data(&self, ordinal: usize) -> NodeAddr {
        data_addr(&self.cluster, ordinal)
    }

    pub fn node(&self, ordinal: usize) -> FakeNode {
        self.nodes.lock().unwrap()[&self.data(ordinal)].clone()
    }

    pub fn stop_node(&self, ordinal: usize) {
        let addr = self.data(ordinal);
        if let Some(node) = self.nodes.lock().unwrap().get_mut(&addr) {
            node.up = false;
        }
    }

    /// Data servers currently in the master role
    pub fn data_masters(&self) -> Vec<NodeAddr> {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, n)| n.up && n.role == Role::Master)
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    /// Master each agent currently reports
    pub fn reported_masters(&self) -> Vec<NodeAddr> {
        self.agents
            .iter()
            .map(|a| a.state().current_master())
            .collect()
    }

    pub fn epochs(&self) -> Vec<u64> {
        self.agents
            .iter()
            .map(|a| a.state().machine().epoch())
            .collect()
    }

    pub async fn tick_all(&self) {
        for agent in &self.agents {
            agent.supervisor().tick().await;
        }
    }

    /// `rounds` supervision rounds, `tick` apart
    pub async fn run_rounds(&self, rounds: usize, tick: Duration) {
        for _ in 0..rounds {
            self.tick_all().await;
            tokio::time::sleep(tick).await;
        }
    }

    /// Keep every agent supervising in the background
    pub fn drive(self: &Arc<Self>, tick: Duration) -> tokio::task::JoinHandle<()> {
        let fleet = self.clone();
        tokio::spawn(async move {
            loop {
                fleet.tick_all().await;
                tokio::time::sleep(tick).await;
            }
        })
    }
}
