//! Monitor configuration
//!
//! The in-memory form of what an agent monitors and who it knows about. It
//! renders to the sentinel configuration format, so the same bootstrap can
//! feed the built-in agent or an external sentinel process.

use crate::common::{MonitorId, NodeAddr, Result, SentinelSettings, METRICS};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::Path;

#[derive(Clone)]
pub struct MonitorConfig {
    pub my_id: MonitorId,
    /// Monitored target name
    pub name: String,
    /// Believed master address
    pub master: NodeAddr,
    pub settings: SentinelSettings,
    /// Peer agents, keyed by monitor identity
    pub known_sentinels: BTreeMap<MonitorId, NodeAddr>,
    /// Replicas, keyed by full hostname
    pub known_replicas: BTreeMap<String, NodeAddr>,
    /// Address this agent announces to its peers
    pub announce: NodeAddr,
    pub password: Option<String>,
    /// Configuration epoch of `master`
    pub epoch: u64,
}

impl std::fmt::Debug for MonitorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorConfig")
            .field("my_id", &self.my_id)
            .field("name", &self.name)
            .field("master", &self.master)
            .field("known_sentinels", &self.known_sentinels.len())
            .field("known_replicas", &self.known_replicas.len())
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl MonitorConfig {
    pub fn new(
        my_id: MonitorId,
        name: impl Into<String>,
        master: NodeAddr,
        settings: SentinelSettings,
        announce: NodeAddr,
    ) -> Self {
        Self {
            my_id,
            name: name.into(),
            master,
            settings,
            known_sentinels: BTreeMap::new(),
            known_replicas: BTreeMap::new(),
            announce,
            password: None,
            epoch: 0,
        }
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    /// Register a peer agent. Returns true when the entry is new or moved.
    pub fn add_known_sentinel(&mut self, id: MonitorId, addr: NodeAddr) -> bool {
        if id == self.my_id {
            return false;
        }
        let changed = self.known_sentinels.get(&id) != Some(&addr);
        if changed {
            self.known_sentinels.insert(id, addr);
            METRICS.known_sentinels.set(self.known_sentinels.len() as u64);
        }
        changed
    }

    /// Register a replica. Returns true when the entry is new or moved.
    pub fn add_known_replica(&mut self, addr: NodeAddr) -> bool {
        if addr == self.master {
            return false;
        }
        let key = addr.host.to_ascii_lowercase();
        let changed = self.known_replicas.get(&key) != Some(&addr);
        if changed {
            self.known_replicas.insert(key, addr);
            METRICS.known_replicas.set(self.known_replicas.len() as u64);
        }
        changed
    }

    /// Switch to a new master at `epoch`. The promoted node leaves the
    /// replica set and the previous master joins it.
    pub fn set_master(&mut self, master: NodeAddr, epoch: u64) {
        let previous = std::mem::replace(&mut self.master, master);
        self.epoch = epoch;
        self.known_replicas
            .remove(&self.master.host.to_ascii_lowercase());
        if previous != self.master {
            self.add_known_replica(previous);
        }
        METRICS.known_replicas.set(self.known_replicas.len() as u64);
    }

    /// Replicas other than the current master
    pub fn replicas(&self) -> Vec<NodeAddr> {
        self.known_replicas
            .values()
            .filter(|r| **r != self.master)
            .cloned()
            .collect()
    }

    /// Render in the sentinel configuration format
    pub fn render(&self) -> String {
        let name = &self.name;
        let mut out = String::new();
        let _ = writeln!(out, "port {}", self.announce.port);
        let _ = writeln!(out, "sentinel myid {}", self.my_id);
        let _ = writeln!(out, "sentinel resolve-hostnames yes");
        let _ = writeln!(out, "sentinel announce-hostnames yes");
        let _ = writeln!(
            out,
            "sentinel monitor {} {} {} {}",
            name, self.master.host, self.master.port, self.settings.quorum
        );
        let _ = writeln!(
            out,
            "sentinel down-after-milliseconds {} {}",
            name, self.settings.down_after_ms
        );
        let _ = writeln!(
            out,
            "sentinel failover-timeout {} {}",
            name, self.settings.failover_timeout_ms
        );
        let _ = writeln!(
            out,
            "sentinel parallel-syncs {} {}",
            name, self.settings.parallel_syncs
        );
        let _ = writeln!(out, "sentinel config-epoch {} {}", name, self.epoch);
        if let Some(password) = &self.password {
            let _ = writeln!(out, "sentinel auth-pass {} {}", name, password);
            let _ = writeln!(out, "requirepass {}", password);
        }
        for (id, addr) in &self.known_sentinels {
            let _ = writeln!(
                out,
                "sentinel known-sentinel {} {} {} {}",
                name, addr.host, addr.port, id
            );
        }
        for addr in self.known_replicas.values() {
            let _ = writeln!(
                out,
                "sentinel known-replica {} {} {}",
                name, addr.host, addr.port
            );
        }
        let _ = writeln!(out, "sentinel announce-ip {}", self.announce.host);
        let _ = writeln!(out, "sentinel announce-port {}", self.announce.port);
        out
    }

    /// Write the rendered configuration atomically (temp file, then rename)
    pub async fn persist(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }
        let tmp = path.with_extension("conf.tmp");
        tokio::fs::write(&tmp, self.render()).await?;
        tokio::fs::rename(&tmp, path).await?;
        tracing::debug!(path = %path.display(), "Persisted monitor configuration");
        Ok(())
    }
}
