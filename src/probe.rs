//! Liveness and readiness checks
//!
//! Probes report health to the orchestrator only; failover decisions never
//! look at them.

use crate::common::{NodeAddr, METRICS};
use crate::protocol::{DataPlane, PingReply, SentinelClient};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// Alive while responding; loading the dataset still counts as alive
    Liveness,
    /// Alive and done loading
    Readiness,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeOutcome {
    pub healthy: bool,
    pub detail: String,
}

impl ProbeOutcome {
    fn pass(detail: impl Into<String>) -> Self {
        Self {
            healthy: true,
            detail: detail.into(),
        }
    }

    fn fail(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: detail.into(),
        }
    }

    fn record(self) -> Self {
        if self.healthy {
            METRICS.probes_ok.inc();
        } else {
            METRICS.probes_failed.inc();
        }
        self
    }
}

/// Interpret a ping reply for the given probe
pub fn evaluate(kind: ProbeKind, reply: &PingReply) -> ProbeOutcome {
    match (kind, reply) {
        (_, PingReply::Pong) => ProbeOutcome::pass("PONG"),
        (ProbeKind::Liveness, PingReply::Loading) => ProbeOutcome::pass("LOADING"),
        (ProbeKind::Readiness, PingReply::Loading) => {
            ProbeOutcome::fail("LOADING Redis is loading the dataset in memory")
        }
        (_, PingReply::Other(reply)) => ProbeOutcome::fail(reply.clone()),
    }
}

/// Probe a single data node
pub async fn check(
    data_plane: &dyn DataPlane,
    node: &NodeAddr,
    kind: ProbeKind,
    timeout: Duration,
) -> ProbeOutcome {
    let outcome = match tokio::time::timeout(timeout, data_plane.ping(node)).await {
        Ok(Ok(reply)) => evaluate(kind, &reply),
        Ok(Err(e)) => ProbeOutcome::fail(e.to_string()),
        Err(_) => ProbeOutcome::fail(format!("no reply from {} within {:?}", node, timeout)),
    };
    outcome.record()
}

/// Probe the local node and its master; both must pass
pub async fn check_with_master(
    data_plane: &dyn DataPlane,
    local: &NodeAddr,
    master: &NodeAddr,
    kind: ProbeKind,
    timeout: Duration,
) -> ProbeOutcome {
    let local_outcome = check(data_plane, local, kind, timeout).await;
    let master_outcome = check(data_plane, master, kind, timeout).await;
    match (local_outcome.healthy, master_outcome.healthy) {
        (true, true) => ProbeOutcome::pass("local and master healthy"),
        (false, _) => ProbeOutcome::fail(format!("local: {}", local_outcome.detail)),
        (true, false) => ProbeOutcome::fail(format!("master: {}", master_outcome.detail)),
    }
}

/// Probe the monitor agent
pub async fn check_sentinel(client: &SentinelClient) -> ProbeOutcome {
    let outcome = match client.ping().await {
        Ok(true) => ProbeOutcome::pass("PONG"),
        Ok(false) => ProbeOutcome::fail(format!("{} did not answer PONG", client.endpoint())),
        Err(e) => ProbeOutcome::fail(e.to_string()),
    };
    outcome.record()
}
