//! Startup role resolution

use crate::common::{
    retry_with_backoff, ClusterConfig, Error, NodeAddr, Result, RetryConfig, Role,
};
use crate::discovery::{wait_until_visible, ClusterView, PeerDirectory};
use crate::protocol::MonitorQuorum;
use std::net::IpAddr;
use std::sync::Arc;

/// Outcome of role resolution, fixed for the lifetime of the process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleDecision {
    pub role: Role,
    /// The master this member starts against (itself when `role` is master)
    pub master: Option<NodeAddr>,
    pub view: ClusterView,
}

impl RoleDecision {
    pub fn is_master(&self) -> bool {
        self.role.is_master()
    }
}

/// Decides master vs replica from discovery and the monitor quorum
pub struct RoleResolver {
    cluster: ClusterConfig,
    retry: RetryConfig,
    directory: Arc<dyn PeerDirectory>,
    quorum: Arc<dyn MonitorQuorum>,
}

impl RoleResolver {
    pub fn new(
        cluster: ClusterConfig,
        retry: RetryConfig,
        directory: Arc<dyn PeerDirectory>,
        quorum: Arc<dyn MonitorQuorum>,
    ) -> Self {
        Self {
            cluster,
            retry,
            directory,
            quorum,
        }
    }

    /// Address other members use to reach this member's data server
    pub fn own_data_addr(&self, hostname: &str) -> NodeAddr {
        NodeAddr::new(self.cluster.full_hostname(hostname), self.cluster.data_port)
    }

    /// Wait for the discovery barrier, then decide the role.
    ///
    /// Alone in discovery means master. Otherwise the quorum is asked for the
    /// current master; "none yet" is retried until the budget is spent.
    pub async fn resolve_role(&self, self_addr: IpAddr, hostname: &str) -> Result<RoleDecision> {
        let view = wait_until_visible(
            self.directory.as_ref(),
            &self.cluster.headless_service,
            self_addr,
            self.retry.dns_policy(),
        )
        .await?;

        let own = self.own_data_addr(hostname);
        if view.is_alone() {
            tracing::info!(%self_addr, master = %own, "Only member in discovery, starting as master");
            return Ok(RoleDecision {
                role: Role::Master,
                master: Some(own),
                view,
            });
        }

        let master = self.query_master().await?;
        if master.same_host(&own.host) || master.same_host(&self_addr.to_string()) {
            tracing::info!(master = %master, "Quorum reports this member as master");
            return Ok(RoleDecision {
                role: Role::Master,
                master: Some(own),
                view,
            });
        }

        tracing::info!(master = %master, peers = view.members.len(), "Starting as replica");
        Ok(RoleDecision {
            role: Role::Replica,
            master: Some(master),
            view,
        })
    }

    async fn query_master(&self) -> Result<NodeAddr> {
        let policy = self.retry.master_policy();
        let name = self.cluster.name.as_str();
        let result = retry_with_backoff(policy, move || async move {
            match self.quorum.master_addr(name).await? {
                Some(addr) => Ok(addr),
                None => Err(Error::Timeout(format!("no master known for {}", name))),
            }
        })
        .await;

        match result {
            Ok(addr) => Ok(addr),
            Err(e) if e.is_retryable() => {
                tracing::error!(name, error = %e, "Quorum did not report a master");
                Err(Error::MasterUnknown {
                    name: name.to_string(),
                    attempts: policy.attempts,
                })
            }
            Err(e) => Err(e),
        }
    }
}
