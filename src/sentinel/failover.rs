//! Graceful handover on shutdown
//!
//! A stopping master asks the quorum to fail it over and waits, bounded,
//! until the quorum reports a different master. Every failure on this path
//! is downgraded to a warning; only the timeout is surfaced.

use crate::common::{poll_until, Error, MonitorId, NodeAddr, Result, METRICS};
use crate::protocol::MonitorQuorum;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// One-shot handover request, dropped when the handover ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverRequest {
    pub name: String,
    pub requester: MonitorId,
    pub deadline: Instant,
}

impl FailoverRequest {
    pub fn new(name: impl Into<String>, requester: MonitorId, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            requester,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

pub struct FailoverCoordinator {
    quorum: Arc<dyn MonitorQuorum>,
    name: String,
    /// This member's data address as the quorum reports it
    own: NodeAddr,
    requester: MonitorId,
    poll_interval: Duration,
}

impl FailoverCoordinator {
    pub fn new(
        quorum: Arc<dyn MonitorQuorum>,
        name: impl Into<String>,
        own: NodeAddr,
        requester: MonitorId,
        poll_interval: Duration,
    ) -> Self {
        Self {
            quorum,
            name: name.into(),
            own,
            requester,
            poll_interval,
        }
    }

    fn is_own(&self, master: &NodeAddr) -> bool {
        master.same_host(&self.own.host) && master.port == self.own.port
    }

    /// Is this member the master according to the quorum right now?
    async fn is_master(&self) -> bool {
        match self.quorum.master_addr(&self.name).await {
            Ok(Some(master)) => self.is_own(&master),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(name = %self.name, error = %e, "Could not query master");
                false
            }
        }
    }

    /// Hand the master role over before this member stops.
    ///
    /// Not master: returns immediately. Master: requests a failover, then
    /// polls until another member is reported as master or `timeout`
    /// elapses.
    pub async fn on_member_stopping(&self, timeout: Duration) -> Result<()> {
        let request = FailoverRequest::new(self.name.clone(), self.requester.clone(), timeout);
        let started = Instant::now();

        match tokio::time::timeout_at(request.deadline, self.is_master()).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(name = %self.name, "Not the master, nothing to hand over");
                return Ok(());
            }
            Err(_) => {
                METRICS.failovers_timed_out.inc();
                tracing::warn!(name = %self.name, ?timeout, "Master query did not answer");
                return Err(Error::FailoverTimedOut {
                    name: request.name,
                    waited: timeout,
                });
            }
        }

        tracing::info!(
            name = %request.name,
            requester = %request.requester,
            ?timeout,
            "Master is stopping, requesting failover"
        );

        let requested = self.quorum.failover(&request.name);
        match tokio::time::timeout_at(request.deadline, requested).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(name = %request.name, error = %e, "Failover request rejected")
            }
            Err(_) => {
                tracing::warn!(name = %request.name, "Failover request did not answer in time")
            }
        }

        let handed_over = poll_until(request.remaining(), self.poll_interval, move || async move {
            match self.quorum.master_addr(&self.name).await {
                Ok(Some(master)) => !self.is_own(&master),
                Ok(None) => false,
                Err(e) => {
                    tracing::debug!(error = %e, "Master query failed while waiting");
                    false
                }
            }
        })
        .await;

        let waited = started.elapsed();
        METRICS.handover_wait.observe(waited);
        if handed_over {
            tracing::info!(name = %request.name, ?waited, "Master failed over to another member");
            Ok(())
        } else {
            METRICS.failovers_timed_out.inc();
            tracing::warn!(name = %request.name, ?waited, "Master failover did not complete");
            Err(Error::FailoverTimedOut {
                name: request.name,
                waited: timeout,
            })
        }
    }
}
