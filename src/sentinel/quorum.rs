//! Down-detection and failover state machine
//!
//! Pure logic: no I/O, time is passed in. The supervisor feeds it master
//! reachability and peer opinions each tick and acts on the verdicts.
//!
//! ```text
//! MasterAlive -> SuspectedDown -> ObjectivelyDown -> FailoverInProgress
//!      ^              ^                                  |
//!      |              +---- promotion failed / timeout --+
//!      +---------------- new master confirmed -----------+
//! ```

use crate::common::{Error, MonitorId, NodeAddr, Result, Role, METRICS};
use crate::protocol::{PeerOpinion, ReplicationInfo};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverState {
    MasterAlive,
    /// Local master check failing for longer than down-after
    SuspectedDown,
    /// At least `quorum` agents concur
    ObjectivelyDown,
    FailoverInProgress {
        leader: MonitorId,
        started: Instant,
        manual: bool,
    },
}

impl FailoverState {
    pub fn label(&self) -> &'static str {
        match self {
            FailoverState::MasterAlive => "master-alive",
            FailoverState::SuspectedDown => "s_down",
            FailoverState::ObjectivelyDown => "o_down",
            FailoverState::FailoverInProgress { .. } => "failover-in-progress",
        }
    }
}

/// What the supervisor should do after an evaluation step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Nothing changed
    Stay,
    BecameSuspected,
    BecameObjectivelyDown,
    /// This agent leads the failover and must promote a replica
    Lead,
    /// Another agent leads; wait for it
    Follow(MonitorId),
    /// The failover did not finish in time; the leader is excluded
    TimedOut(MonitorId),
    Recovered,
}

#[derive(Debug, Clone, Copy)]
struct Opinion {
    down: bool,
    at: Instant,
}

/// Per-target failover state of one agent
#[derive(Debug, Clone)]
pub struct FailoverMachine {
    my_id: MonitorId,
    quorum: usize,
    down_after: Duration,
    failover_timeout: Duration,
    master: NodeAddr,
    epoch: u64,
    /// Agent whose view of `master` this machine currently holds
    view_owner: MonitorId,
    state: FailoverState,
    last_ok: Instant,
    opinions: BTreeMap<MonitorId, Opinion>,
    failed_leaders: BTreeSet<MonitorId>,
}

impl FailoverMachine {
    pub fn new(
        my_id: MonitorId,
        master: NodeAddr,
        quorum: usize,
        down_after: Duration,
        failover_timeout: Duration,
        now: Instant,
    ) -> Self {
        Self {
            view_owner: my_id.clone(),
            my_id,
            quorum: quorum.max(1),
            down_after,
            failover_timeout,
            master,
            epoch: 0,
            state: FailoverState::MasterAlive,
            last_ok: now,
            opinions: BTreeMap::new(),
            failed_leaders: BTreeSet::new(),
        }
    }

    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn my_id(&self) -> &MonitorId {
        &self.my_id
    }

    pub fn master(&self) -> &NodeAddr {
        &self.master
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn state(&self) -> &FailoverState {
        &self.state
    }

    pub fn is_objectively_down(&self) -> bool {
        matches!(self.state, FailoverState::ObjectivelyDown)
    }

    /// The quorum has declared the master dead: objectively down, or
    /// replaced by an automatic failover that has not completed yet
    pub fn master_failed(&self) -> bool {
        matches!(
            self.state,
            FailoverState::ObjectivelyDown
                | FailoverState::FailoverInProgress { manual: false, .. }
        )
    }

    pub fn in_progress(&self) -> bool {
        matches!(self.state, FailoverState::FailoverInProgress { .. })
    }

    /// This agent leads a failover that has not completed yet
    pub fn pending_promotion(&self) -> bool {
        matches!(&self.state, FailoverState::FailoverInProgress { leader, .. } if *leader == self.my_id)
    }

    /// Local view: master unreachable for longer than down-after
    pub fn locally_down(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_ok) > self.down_after
    }

    /// Feed the result of the local master check
    pub fn observe_master(&mut self, reachable: bool, now: Instant) {
        if !reachable {
            return;
        }
        self.last_ok = now;
        if matches!(
            self.state,
            FailoverState::SuspectedDown | FailoverState::ObjectivelyDown
        ) {
            tracing::info!(master = %self.master, "Master reachable again");
            self.state = FailoverState::MasterAlive;
        }
    }

    pub fn record_opinion(&mut self, peer: MonitorId, down: bool, now: Instant) {
        if peer != self.my_id {
            self.opinions.insert(peer, Opinion { down, at: now });
        }
    }

    /// Drop a peer's opinion, e.g. when it could not be reached
    pub fn forget_opinion(&mut self, peer: &MonitorId) {
        self.opinions.remove(peer);
    }

    /// Agents currently reporting the master down, self included.
    /// Opinions older than down-after no longer count.
    pub fn concurring(&self, now: Instant) -> BTreeSet<MonitorId> {
        let mut set: BTreeSet<MonitorId> = self
            .opinions
            .iter()
            .filter(|(_, o)| o.down && now.saturating_duration_since(o.at) <= self.down_after)
            .map(|(id, _)| id.clone())
            .collect();
        if self.locally_down(now) {
            set.insert(self.my_id.clone());
        }
        set
    }

    pub fn agreeing(&self, now: Instant) -> usize {
        self.concurring(now).len()
    }

    /// Lowest identity among concurring agents that has not already failed
    fn elect_leader(&mut self, concurring: &BTreeSet<MonitorId>) -> Option<MonitorId> {
        let pick = |failed: &BTreeSet<MonitorId>| {
            concurring
                .iter()
                .find(|id| !failed.contains(*id))
                .cloned()
        };
        pick(&self.failed_leaders).or_else(|| {
            // Every concurring agent has failed once; start over
            self.failed_leaders.clear();
            pick(&self.failed_leaders)
        })
    }

    /// Advance the state machine by at most one transition
    pub fn evaluate(&mut self, now: Instant) -> Verdict {
        match self.state.clone() {
            FailoverState::MasterAlive => {
                if self.locally_down(now) {
                    tracing::warn!(master = %self.master, "Master subjectively down");
                    self.state = FailoverState::SuspectedDown;
                    Verdict::BecameSuspected
                } else {
                    Verdict::Stay
                }
            }
            FailoverState::SuspectedDown => {
                if !self.locally_down(now) {
                    self.state = FailoverState::MasterAlive;
                    return Verdict::Recovered;
                }
                let agreeing = self.agreeing(now);
                if agreeing >= self.quorum {
                    tracing::warn!(
                        master = %self.master,
                        agreeing,
                        quorum = self.quorum,
                        "Master objectively down"
                    );
                    METRICS.odown_transitions.inc();
                    self.state = FailoverState::ObjectivelyDown;
                    Verdict::BecameObjectivelyDown
                } else {
                    Verdict::Stay
                }
            }
            FailoverState::ObjectivelyDown => {
                let concurring = self.concurring(now);
                if concurring.len() < self.quorum {
                    self.state = FailoverState::SuspectedDown;
                    return Verdict::Stay;
                }
                let Some(leader) = self.elect_leader(&concurring) else {
                    return Verdict::Stay;
                };
                self.state = FailoverState::FailoverInProgress {
                    leader: leader.clone(),
                    started: now,
                    manual: false,
                };
                if leader == self.my_id {
                    tracing::info!(master = %self.master, "Elected failover leader");
                    Verdict::Lead
                } else {
                    tracing::info!(master = %self.master, %leader, "Following failover leader");
                    Verdict::Follow(leader)
                }
            }
            FailoverState::FailoverInProgress {
                leader,
                started,
                manual,
            } => {
                if now.saturating_duration_since(started) > self.failover_timeout {
                    tracing::warn!(master = %self.master, %leader, "Failover timed out");
                    self.fail_leader(leader.clone(), manual, now);
                    Verdict::TimedOut(leader)
                } else if leader == self.my_id {
                    Verdict::Lead
                } else {
                    Verdict::Stay
                }
            }
        }
    }

    fn fail_leader(&mut self, leader: MonitorId, manual: bool, now: Instant) {
        self.failed_leaders.insert(leader);
        if manual {
            self.last_ok = now;
            self.state = FailoverState::MasterAlive;
        } else {
            self.state = FailoverState::SuspectedDown;
        }
    }

    /// Promotion failed; hand the failover to the next agent
    pub fn abort_failover(&mut self, now: Instant) {
        if let FailoverState::FailoverInProgress { leader, manual, .. } = self.state.clone() {
            self.fail_leader(leader, manual, now);
        }
    }

    /// A new master is confirmed. Returns the new epoch.
    pub fn complete_failover(&mut self, new_master: NodeAddr, now: Instant) -> u64 {
        self.epoch += 1;
        tracing::info!(
            old = %self.master,
            new = %new_master,
            epoch = self.epoch,
            "Failover complete"
        );
        self.view_owner = self.my_id.clone();
        self.switch_master(new_master, now);
        METRICS.failovers_completed.inc();
        self.epoch
    }

    fn switch_master(&mut self, master: NodeAddr, now: Instant) {
        self.master = master;
        self.state = FailoverState::MasterAlive;
        self.last_ok = now;
        self.opinions.clear();
        self.failed_leaders.clear();
        METRICS.epoch.set(self.epoch);
    }

    /// Manual failover: this agent leads, no agreement needed
    pub fn request_manual_failover(&mut self, now: Instant) -> Result<()> {
        if self.in_progress() {
            return Err(Error::Server(
                "INPROG Failover already in progress".to_string(),
            ));
        }
        tracing::info!(master = %self.master, "Manual failover requested");
        self.state = FailoverState::FailoverInProgress {
            leader: self.my_id.clone(),
            started: now,
            manual: true,
        };
        Ok(())
    }

    /// Compare a peer's view with ours. A strictly newer epoch wins; on equal
    /// epochs the view first held by the lower monitor identity wins. Returns
    /// the displaced master when the peer's view is adopted.
    pub fn observe_peer(
        &mut self,
        peer: &MonitorId,
        opinion: &PeerOpinion,
        now: Instant,
    ) -> Option<NodeAddr> {
        let master = opinion.master.as_ref()?;
        let newer = opinion.epoch > self.epoch;
        let tie_lost = opinion.epoch == self.epoch && *peer < self.view_owner;
        if *master == self.master {
            if newer {
                self.epoch = opinion.epoch;
                METRICS.epoch.set(self.epoch);
            }
            return None;
        }
        if !(newer || tie_lost) {
            return None;
        }
        tracing::info!(
            %peer,
            old = %self.master,
            new = %master,
            epoch = opinion.epoch,
            "Adopting peer configuration"
        );
        let previous = self.master.clone();
        self.epoch = opinion.epoch;
        self.view_owner = peer.clone();
        self.switch_master(master.clone(), now);
        Some(previous)
    }
}

/// Pick the replica to promote: reachable replicas only, highest offset, then
/// a connected replication link, then the lowest address.
pub fn select_replica(candidates: &[(NodeAddr, ReplicationInfo)]) -> Option<NodeAddr> {
    candidates
        .iter()
        .filter(|(_, info)| info.role == Role::Replica)
        .max_by(|(a_addr, a), (b_addr, b)| {
            a.offset
                .cmp(&b.offset)
                .then(a.link_up.cmp(&b.link_up))
                .then(b_addr.cmp(a_addr))
        })
        .map(|(addr, _)| addr.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(host: &str) -> MonitorId {
        MonitorId::from_hostname(host)
    }

    fn machine(now: Instant) -> FailoverMachine {
        FailoverMachine::new(
            id("redis-node-1"),
            NodeAddr::new("redis-node-0.svc", 6379),
            2,
            Duration::from_secs(5),
            Duration::from_secs(18),
            now,
        )
    }

    fn replica(offset: u64, link_up: bool) -> ReplicationInfo {
        ReplicationInfo {
            role: Role::Replica,
            offset,
            master: None,
            link_up,
        }
    }

    #[test]
    fn test_suspected_after_down_after() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        assert_eq!(m.evaluate(t0 + Duration::from_secs(5)), Verdict::Stay);
        assert_eq!(
            m.evaluate(t0 + Duration::from_secs(6)),
            Verdict::BecameSuspected
        );
        m.observe_master(true, t0 + Duration::from_secs(7));
        assert_eq!(m.state(), &FailoverState::MasterAlive);
    }

    #[test]
    fn test_odown_needs_quorum() {
        let t0 = Instant::now();
        let now = t0 + Duration::from_secs(10);
        let mut m = machine(t0);
        m.evaluate(now);
        assert_eq!(m.evaluate(now), Verdict::Stay);
        assert!(!m.is_objectively_down());

        m.record_opinion(id("redis-node-2"), true, now);
        assert_eq!(m.evaluate(now), Verdict::BecameObjectivelyDown);
    }

    #[test]
    fn test_stale_opinions_do_not_count() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        m.record_opinion(id("redis-node-2"), true, t0);
        let now = t0 + Duration::from_secs(10);
        m.evaluate(now);
        assert_eq!(m.agreeing(now), 1);
        assert_eq!(m.evaluate(now), Verdict::Stay);
    }

    /// Two identities in a fixed order, whatever their hashes are
    fn ordered_pair() -> (MonitorId, MonitorId) {
        let a = id("redis-node-1");
        let b = id("redis-node-2");
        if a < b {
            (a, b)
        } else {
            (b, a)
        }
    }

    fn machine_as(my_id: MonitorId, now: Instant) -> FailoverMachine {
        FailoverMachine::new(
            my_id,
            NodeAddr::new("redis-node-0.svc", 6379),
            2,
            Duration::from_secs(5),
            Duration::from_secs(18),
            now,
        )
    }

    fn reach_failover(m: &mut FailoverMachine, peer: MonitorId, now: Instant) -> Verdict {
        m.record_opinion(peer, true, now);
        m.evaluate(now);
        m.evaluate(now);
        m.evaluate(now)
    }

    #[test]
    fn test_leader_is_lowest_identity() {
        let t0 = Instant::now();
        let now = t0 + Duration::from_secs(10);
        let (low, high) = ordered_pair();

        let mut lower = machine_as(low.clone(), t0);
        assert_eq!(reach_failover(&mut lower, high.clone(), now), Verdict::Lead);
        assert!(lower.pending_promotion());

        let mut higher = machine_as(high, t0);
        assert_eq!(
            reach_failover(&mut higher, low.clone(), now),
            Verdict::Follow(low)
        );
        assert!(!higher.pending_promotion());
    }

    #[test]
    fn test_automatic_failover_keeps_master_failed() {
        let t0 = Instant::now();
        let now = t0 + Duration::from_secs(10);
        let (low, high) = ordered_pair();
        let mut m = machine_as(high, t0);
        reach_failover(&mut m, low, now);
        assert!(m.in_progress());
        assert!(m.master_failed());

        let mut manual = machine(t0);
        manual.request_manual_failover(t0).unwrap();
        assert!(manual.in_progress());
        assert!(!manual.master_failed());
    }

    #[test]
    fn test_timeout_excludes_failed_leader() {
        let t0 = Instant::now();
        let now = t0 + Duration::from_secs(10);
        let mut m = machine(t0);
        let peer = id("redis-node-2");
        m.record_opinion(peer.clone(), true, now);
        m.evaluate(now);
        m.evaluate(now);
        let first = match m.evaluate(now) {
            Verdict::Lead => m.my_id().clone(),
            Verdict::Follow(leader) => leader,
            other => panic!("unexpected verdict {:?}", other),
        };

        let later = now + Duration::from_secs(19);
        m.record_opinion(peer, true, later);
        assert_eq!(m.evaluate(later), Verdict::TimedOut(first.clone()));
        assert_eq!(m.state(), &FailoverState::SuspectedDown);

        m.evaluate(later);
        let second = match m.evaluate(later) {
            Verdict::Lead => m.my_id().clone(),
            Verdict::Follow(leader) => leader,
            other => panic!("unexpected verdict {:?}", other),
        };
        assert_ne!(first, second);
    }

    #[test]
    fn test_complete_failover_bumps_epoch() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        m.request_manual_failover(t0).unwrap();
        assert!(m.pending_promotion());
        let epoch = m.complete_failover(NodeAddr::new("redis-node-2.svc", 6379), t0);
        assert_eq!(epoch, 1);
        assert_eq!(m.master().host, "redis-node-2.svc");
        assert_eq!(m.state(), &FailoverState::MasterAlive);
    }

    #[test]
    fn test_manual_failover_rejects_inprog() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        m.request_manual_failover(t0).unwrap();
        let err = m.request_manual_failover(t0).unwrap_err();
        assert!(err.to_string().contains("INPROG"));
    }

    #[test]
    fn test_manual_failover_timeout_returns_to_alive() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        m.request_manual_failover(t0).unwrap();
        let later = t0 + Duration::from_secs(19);
        assert!(matches!(m.evaluate(later), Verdict::TimedOut(_)));
        assert_eq!(m.state(), &FailoverState::MasterAlive);
    }

    #[test]
    fn test_observe_peer_newer_epoch_wins() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        let opinion = PeerOpinion {
            down: false,
            epoch: 3,
            master: Some(NodeAddr::new("redis-node-2.svc", 6379)),
        };
        let displaced = m.observe_peer(&id("redis-node-9"), &opinion, t0);
        assert_eq!(displaced, Some(NodeAddr::new("redis-node-0.svc", 6379)));
        assert_eq!(m.epoch(), 3);

        let stale = PeerOpinion {
            down: false,
            epoch: 2,
            master: Some(NodeAddr::new("redis-node-0.svc", 6379)),
        };
        assert_eq!(m.observe_peer(&id("redis-node-9"), &stale, t0), None);
        assert_eq!(m.master().host, "redis-node-2.svc");
    }

    #[test]
    fn test_observe_peer_tie_goes_to_lower_identity() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        let opinion = PeerOpinion {
            down: false,
            epoch: 0,
            master: Some(NodeAddr::new("redis-node-2.svc", 6379)),
        };
        let lower = (0..32)
            .map(|i| id(&format!("peer-{}", i)))
            .find(|p| p < m.my_id())
            .unwrap();
        let higher = (0..32)
            .map(|i| id(&format!("peer-{}", i)))
            .find(|p| p > m.my_id())
            .unwrap();

        assert_eq!(m.observe_peer(&higher, &opinion, t0), None);
        assert!(m.observe_peer(&lower, &opinion, t0).is_some());
        assert_eq!(m.master().host, "redis-node-2.svc");
    }

    #[test]
    fn test_tie_keeps_lowest_owner_view() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        let mut lower: Vec<MonitorId> = (0..64)
            .map(|i| id(&format!("peer-{}", i)))
            .filter(|p| p < m.my_id())
            .take(2)
            .collect();
        lower.sort();
        let (lowest, middle) = (lower[0].clone(), lower[1].clone());

        let view = |host: &str| PeerOpinion {
            down: false,
            epoch: 0,
            master: Some(NodeAddr::new(host, 6379)),
        };
        assert!(m.observe_peer(&lowest, &view("a.svc"), t0).is_some());
        assert_eq!(m.observe_peer(&middle, &view("b.svc"), t0), None);
        assert_eq!(m.master().host, "a.svc");
    }

    #[test]
    fn test_select_replica_ordering() {
        let a = NodeAddr::new("a.svc", 6379);
        let b = NodeAddr::new("b.svc", 6379);
        let c = NodeAddr::new("c.svc", 6379);

        let picked = select_replica(&[
            (a.clone(), replica(100, true)),
            (b.clone(), replica(200, false)),
            (c.clone(), replica(150, true)),
        ]);
        assert_eq!(picked, Some(b.clone()));

        let picked = select_replica(&[
            (a.clone(), replica(100, false)),
            (b.clone(), replica(100, true)),
        ]);
        assert_eq!(picked, Some(b.clone()));

        let picked = select_replica(&[(c, replica(100, true)), (a.clone(), replica(100, true))]);
        assert_eq!(picked, Some(a));
    }

    #[test]
    fn test_select_replica_skips_masters() {
        let master = ReplicationInfo {
            role: Role::Master,
            offset: 999,
            master: None,
            link_up: true,
        };
        assert_eq!(
            select_replica(&[(NodeAddr::new("a.svc", 6379), master)]),
            None
        );
    }
}
