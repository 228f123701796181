//! Built-in monitor agent
//!
//! One agent runs per member. Three tasks share an [`AgentState`]: the
//! supervision loop, the discovery reconciliation loop and the protocol
//! listener. State sits behind std locks that are never held across an
//! await point.

use super::bootstrap::register_peers;
use super::config::MonitorConfig;
use super::listener;
use super::quorum::{FailoverMachine, FailoverState};
use super::supervisor::Supervisor;
use crate::common::{ClusterConfig, MonitorId, NodeAddr, Result, METRICS};
use crate::discovery::PeerDirectory;
use crate::protocol::{DataPlane, MonitorQuorum, OpinionQuery, PeerChannel, PeerOpinion};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

/// Shared state of one agent
pub struct AgentState {
    config: RwLock<MonitorConfig>,
    machine: Mutex<FailoverMachine>,
    wake: Notify,
}

impl AgentState {
    pub fn new(config: MonitorConfig) -> Self {
        let machine = FailoverMachine::new(
            config.my_id.clone(),
            config.master.clone(),
            config.settings.quorum,
            config.settings.down_after(),
            config.settings.failover_timeout(),
            Instant::now(),
        )
        .with_epoch(config.epoch);
        METRICS.epoch.set(config.epoch);
        Self {
            config: RwLock::new(config),
            machine: Mutex::new(machine),
            wake: Notify::new(),
        }
    }

    /// Snapshot of the monitor configuration
    pub fn config(&self) -> MonitorConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_config<R>(&self, f: impl FnOnce(&mut MonitorConfig) -> R) -> R {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut config)
    }

    pub fn machine(&self) -> MutexGuard<'_, FailoverMachine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn my_id(&self) -> MonitorId {
        self.machine().my_id().clone()
    }

    pub fn name(&self) -> String {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .name
            .clone()
    }

    pub fn current_master(&self) -> NodeAddr {
        self.machine().master().clone()
    }

    /// Bring the configuration in line with the machine after a master
    /// change. Returns true when the configuration changed.
    pub fn sync_config(&self) -> bool {
        let (master, epoch) = {
            let machine = self.machine();
            (machine.master().clone(), machine.epoch())
        };
        self.update_config(|config| {
            if config.master == master && config.epoch == epoch {
                return false;
            }
            config.set_master(master, epoch);
            true
        })
    }

    /// Answer a peer's `is-master-down-by-addr`
    pub fn opinion_for(&self, query: &OpinionQuery) -> PeerOpinion {
        let machine = self.machine();
        let now = Instant::now();
        PeerOpinion {
            down: *machine.master() == query.master && machine.locally_down(now),
            epoch: machine.epoch(),
            master: Some(machine.master().clone()),
        }
    }

    /// Flags in the sentinel `SENTINEL master` format
    pub fn master_flags(&self) -> String {
        let machine = self.machine();
        let mut flags = vec!["master"];
        match machine.state() {
            FailoverState::MasterAlive => {}
            FailoverState::SuspectedDown => flags.push("s_down"),
            FailoverState::ObjectivelyDown => {
                flags.push("s_down");
                flags.push("o_down");
            }
            FailoverState::FailoverInProgress { manual: false, .. } => {
                flags.extend(["s_down", "o_down", "failover_in_progress"]);
            }
            FailoverState::FailoverInProgress { manual: true, .. } => {
                flags.push("failover_in_progress")
            }
        }
        flags.join(",")
    }

    /// Field/value pairs for `SENTINEL master <name>`
    pub fn master_info(&self) -> Vec<(String, String)> {
        let config = self.config();
        let (master, epoch, state) = {
            let machine = self.machine();
            (
                machine.master().clone(),
                machine.epoch(),
                machine.state().label(),
            )
        };
        vec![
            ("name".into(), config.name),
            ("ip".into(), master.host),
            ("port".into(), master.port.to_string()),
            ("flags".into(), self.master_flags()),
            ("quorum".into(), config.settings.quorum.to_string()),
            (
                "num-other-sentinels".into(),
                config.known_sentinels.len().to_string(),
            ),
            ("num-slaves".into(), config.known_replicas.len().to_string()),
            ("config-epoch".into(), epoch.to_string()),
            ("failover-state".into(), state.to_string()),
            (
                "down-after-milliseconds".into(),
                config.settings.down_after_ms.to_string(),
            ),
            (
                "failover-timeout".into(),
                config.settings.failover_timeout_ms.to_string(),
            ),
            (
                "parallel-syncs".into(),
                config.settings.parallel_syncs.to_string(),
            ),
        ]
    }

    /// Run the supervisor now instead of at the next tick
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    async fn woken(&self) {
        self.wake.notified().await;
    }
}

#[async_trait]
impl MonitorQuorum for AgentState {
    async fn master_addr(&self, name: &str) -> Result<Option<NodeAddr>> {
        if name != self.name() {
            return Ok(None);
        }
        let machine = self.machine();
        if machine.master_failed() {
            return Ok(None);
        }
        Ok(Some(machine.master().clone()))
    }

    async fn failover(&self, name: &str) -> Result<()> {
        if name != self.name() {
            return Err(crate::Error::Server(
                "ERR No such master with that name".into(),
            ));
        }
        self.machine().request_manual_failover(Instant::now())?;
        METRICS.failovers_requested.inc();
        self.wake();
        Ok(())
    }
}

/// A running agent: supervision, reconciliation and the protocol listener
pub struct MonitorAgent {
    state: Arc<AgentState>,
    supervisor: Supervisor,
    cluster: ClusterConfig,
    hostname: String,
    directory: Arc<dyn PeerDirectory>,
    conf_path: Option<PathBuf>,
}

impl MonitorAgent {
    pub fn new(
        config: MonitorConfig,
        cluster: ClusterConfig,
        hostname: impl Into<String>,
        directory: Arc<dyn PeerDirectory>,
        data_plane: Arc<dyn DataPlane>,
        peers: Arc<dyn PeerChannel>,
    ) -> Self {
        let state = Arc::new(AgentState::new(config));
        let supervisor = Supervisor::new(state.clone(), data_plane, peers);
        Self {
            state,
            supervisor,
            cluster,
            hostname: hostname.into(),
            directory,
            conf_path: None,
        }
    }

    /// Persist the configuration here whenever it changes
    pub fn with_conf_path(mut self, path: PathBuf) -> Self {
        self.conf_path = Some(path);
        self
    }

    pub fn state(&self) -> Arc<AgentState> {
        self.state.clone()
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Re-run peer registration against current discovery. Returns the
    /// number of new entries.
    pub async fn reconcile(&self) -> Result<usize> {
        let mut config = self.state.config();
        let added =
            register_peers(&mut config, &self.cluster, self.directory.as_ref(), &self.hostname)
                .await?;
        if added > 0 {
            self.state.update_config(|current| {
                for (id, addr) in &config.known_sentinels {
                    current.add_known_sentinel(id.clone(), addr.clone());
                }
                for addr in config.known_replicas.values() {
                    if *addr != current.master {
                        current.add_known_replica(addr.clone());
                    }
                }
            });
            tracing::info!(added, "Reconciled peers from discovery");
            self.persist().await;
        }
        Ok(added)
    }

    async fn persist(&self) {
        if let Some(path) = &self.conf_path {
            if let Err(e) = self.state.config().persist(path).await {
                tracing::warn!(path = %path.display(), error = %e, "Failed to persist monitor configuration");
            }
        }
    }

    /// Serve until `shutdown` flips to true
    pub async fn run(
        &self,
        listener: TcpListener,
        password: Option<String>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let settings = self.state.config().settings;
        let listener_task = tokio::spawn(listener::serve(
            listener,
            self.state.clone(),
            password,
            shutdown.clone(),
        ));

        let mut tick = tokio::time::interval(settings.tick());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut reconcile = tokio::time::interval(settings.reconcile_interval());
        reconcile.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(my_id = %self.state.my_id(), "Monitor agent running");
        self.persist().await;

        loop {
            tokio::select! {
                _ = tick.tick() => self.supervise().await,
                _ = self.state.woken() => self.supervise().await,
                _ = reconcile.tick() => {
                    if let Err(e) = self.reconcile().await {
                        tracing::warn!(error = %e, "Reconciliation failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Monitor agent stopping");
        listener_task.abort();
        Ok(())
    }

    async fn supervise(&self) {
        let report = self.supervisor.tick().await;
        if report.config_changed {
            self.persist().await;
        }
    }
}
