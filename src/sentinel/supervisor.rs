//! Supervision driver
//!
//! One tick: check the master, exchange opinions with known peers, advance
//! the failover machine and, when this agent leads, promote a replica and
//! repoint the others.

use super::agent::AgentState;
use super::quorum::{select_replica, Verdict};
use crate::common::{MonitorId, NodeAddr, Result, METRICS};
use crate::protocol::{DataPlane, OpinionQuery, PeerChannel, PeerOpinion, PingReply};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// What a tick did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub master_reachable: bool,
    pub verdicts: Vec<Verdict>,
    /// Replica promoted by this agent
    pub promoted: Option<NodeAddr>,
    /// Master adopted from a peer's newer view
    pub adopted: Option<NodeAddr>,
    pub config_changed: bool,
}

pub struct Supervisor {
    state: Arc<AgentState>,
    data_plane: Arc<dyn DataPlane>,
    peers: Arc<dyn PeerChannel>,
}

impl Supervisor {
    pub fn new(
        state: Arc<AgentState>,
        data_plane: Arc<dyn DataPlane>,
        peers: Arc<dyn PeerChannel>,
    ) -> Self {
        Self {
            state,
            data_plane,
            peers,
        }
    }

    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let master = self.state.current_master();

        report.master_reachable = self.master_reachable(&master).await;
        self.state
            .machine()
            .observe_master(report.master_reachable, Instant::now());

        let displaced = self.exchange_opinions(&master, &mut report).await;

        for _ in 0..4 {
            let verdict = self.state.machine().evaluate(Instant::now());
            let done = matches!(verdict, Verdict::Stay | Verdict::Lead | Verdict::Follow(_));
            if verdict != Verdict::Stay {
                report.verdicts.push(verdict);
            }
            if done {
                break;
            }
        }

        let pending = self.state.machine().pending_promotion();
        if pending {
            match self.run_failover().await {
                Ok(promoted) => report.promoted = Some(promoted),
                Err(e) => {
                    tracing::warn!(error = %e, "Failover attempt failed");
                    self.state.machine().abort_failover(Instant::now());
                }
            }
        }

        report.config_changed = self.state.sync_config();

        if let (Some(old), Some(new)) = (displaced, report.adopted.clone()) {
            self.repoint(&old, &new).await;
        }
        report
    }

    async fn master_reachable(&self, master: &NodeAddr) -> bool {
        match self.data_plane.ping(master).await {
            Ok(PingReply::Pong) | Ok(PingReply::Loading) => true,
            Ok(PingReply::Other(reply)) => {
                tracing::debug!(%master, reply, "Unexpected ping reply");
                false
            }
            Err(e) => {
                tracing::debug!(%master, error = %e, "Master ping failed");
                false
            }
        }
    }

    /// Ask every known peer for its opinion in parallel. Returns the master
    /// displaced by an adopted peer view, if any.
    async fn exchange_opinions(
        &self,
        master: &NodeAddr,
        report: &mut TickReport,
    ) -> Option<NodeAddr> {
        let config = self.state.config();
        let query = OpinionQuery {
            name: config.name.clone(),
            master: master.clone(),
            epoch: self.state.machine().epoch(),
            requester: config.my_id.clone(),
        };

        let mut tasks = JoinSet::new();
        for (id, addr) in config.known_sentinels {
            let peers = self.peers.clone();
            let query = query.clone();
            tasks.spawn(async move {
                let result = peers.opinion(&addr, &query).await;
                (id, addr, result)
            });
        }

        let mut replies: Vec<(MonitorId, PeerOpinion)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let Ok((id, addr, result)) = joined else {
                continue;
            };
            match result {
                Ok(opinion) => replies.push((id, opinion)),
                Err(e) => {
                    tracing::debug!(peer = %addr, error = %e, "Peer did not answer");
                    self.state.machine().forget_opinion(&id);
                }
            }
        }
        replies.sort_by(|a, b| a.0.cmp(&b.0));

        let mut displaced = None;
        let now = Instant::now();
        let mut machine = self.state.machine();
        for (id, opinion) in replies {
            if let Some(old) = machine.observe_peer(&id, &opinion, now) {
                report.adopted = Some(machine.master().clone());
                displaced.get_or_insert(old);
            }
            let concerns_master = opinion.master.as_ref() == Some(machine.master());
            machine.record_opinion(id, opinion.down && concerns_master, now);
        }
        displaced
    }

    /// Promote the best replica, or take over one that already reports the
    /// master role, and repoint the rest in batches of parallel-syncs
    async fn run_failover(&self) -> Result<NodeAddr> {
        let config = self.state.config();
        let old_master = self.state.current_master();

        let mut candidates = Vec::new();
        for replica in config.replicas() {
            if replica == old_master {
                continue;
            }
            match self.data_plane.role(&replica).await {
                Ok(info) => candidates.push((replica, info)),
                Err(e) => tracing::debug!(%replica, error = %e, "Replica unreachable"),
            }
        }

        // Another leader got there first
        let already_promoted = candidates
            .iter()
            .find(|(_, info)| info.role.is_master())
            .map(|(addr, _)| addr.clone());

        let chosen = match already_promoted {
            Some(addr) => {
                tracing::info!(old = %old_master, new = %addr, "Replica already promoted");
                addr
            }
            None => {
                let chosen = select_replica(&candidates).ok_or_else(|| {
                    crate::Error::Server("NOGOODSLAVE No suitable replica to promote".into())
                })?;
                tracing::info!(old = %old_master, new = %chosen, "Promoting replica");
                self.data_plane.promote(&chosen).await?;
                METRICS.promotions.inc();
                chosen
            }
        };

        let epoch = self
            .state
            .machine()
            .complete_failover(chosen.clone(), Instant::now());
        self.state
            .update_config(|config| config.set_master(chosen.clone(), epoch));

        let mut others: Vec<NodeAddr> = candidates
            .into_iter()
            .map(|(addr, _)| addr)
            .filter(|addr| *addr != chosen)
            .collect();
        others.push(old_master);

        let batch = config.settings.parallel_syncs.max(1);
        for chunk in others.chunks(batch) {
            let mut tasks = JoinSet::new();
            for node in chunk {
                let data_plane = self.data_plane.clone();
                let node = node.clone();
                let master = chosen.clone();
                tasks.spawn(async move {
                    let result = data_plane.replicate_from(&node, &master).await;
                    (node, result)
                });
            }
            while let Some(joined) = tasks.join_next().await {
                if let Ok((node, Err(e))) = joined {
                    tracing::warn!(%node, error = %e, "Could not repoint replica");
                }
            }
        }

        Ok(chosen)
    }

    /// Turn a master displaced by convergence into a replica of the winner
    async fn repoint(&self, old: &NodeAddr, new: &NodeAddr) {
        if old == new {
            return;
        }
        match self.data_plane.role(old).await {
            Ok(info) if info.role.is_master() => {
                tracing::info!(node = %old, master = %new, "Demoting displaced master");
                if let Err(e) = self.data_plane.replicate_from(old, new).await {
                    tracing::warn!(node = %old, error = %e, "Could not demote displaced master");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(node = %old, error = %e, "Displaced master unreachable"),
        }
    }
}
