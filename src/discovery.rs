//! Peer discovery through the headless service
//!
//! Every member is published under the headless service name once its
//! container is running. Lookups are read-only and stateless; a
//! [`ClusterView`] is a snapshot recomputed on each call.

use crate::common::{retry_with_backoff, Error, Result, RetryPolicy, METRICS};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::net::IpAddr;

/// Name resolution used for member discovery
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Every address currently published under `service`
    async fn resolve(&self, service: &str) -> Result<Vec<IpAddr>>;

    /// Address of a single hostname, or `None` when it does not resolve yet
    async fn resolve_host(&self, hostname: &str) -> Result<Option<IpAddr>>;

    async fn self_visible(&self, service: &str, self_addr: IpAddr) -> Result<bool> {
        Ok(self.resolve(service).await?.contains(&self_addr))
    }
}

/// System resolver
#[derive(Debug, Clone, Default)]
pub struct DnsDirectory;

impl DnsDirectory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerDirectory for DnsDirectory {
    async fn resolve(&self, service: &str) -> Result<Vec<IpAddr>> {
        METRICS.dns_lookups.inc();
        match tokio::net::lookup_host((service, 0)).await {
            Ok(addrs) => {
                let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
                ips.sort();
                ips.dedup();
                Ok(ips)
            }
            Err(e) => {
                METRICS.dns_failures.inc();
                tracing::debug!(service, error = %e, "Service lookup failed");
                Err(Error::Io(e))
            }
        }
    }

    async fn resolve_host(&self, hostname: &str) -> Result<Option<IpAddr>> {
        METRICS.dns_lookups.inc();
        match tokio::net::lookup_host((hostname, 0)).await {
            Ok(addrs) => Ok(prefer_ipv4(addrs.map(|a| a.ip()))),
            Err(e) => {
                METRICS.dns_failures.inc();
                tracing::debug!(hostname, error = %e, "Host lookup failed");
                Ok(None)
            }
        }
    }
}

/// First IPv4 address, else the first address at all
fn prefer_ipv4(addrs: impl IntoIterator<Item = IpAddr>) -> Option<IpAddr> {
    let addrs: Vec<IpAddr> = addrs.into_iter().collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}

/// Discovery snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterView {
    pub members: BTreeSet<IpAddr>,
    pub self_addr: IpAddr,
    pub self_visible: bool,
}

impl ClusterView {
    pub fn new(members: impl IntoIterator<Item = IpAddr>, self_addr: IpAddr) -> Self {
        let members: BTreeSet<IpAddr> = members.into_iter().collect();
        let self_visible = members.contains(&self_addr);
        Self {
            members,
            self_addr,
            self_visible,
        }
    }

    /// Members other than this one
    pub fn others(&self) -> impl Iterator<Item = &IpAddr> {
        self.members.iter().filter(move |a| **a != self.self_addr)
    }

    pub fn is_alone(&self) -> bool {
        self.others().next().is_none()
    }
}

/// This member's own address, from resolving its hostname
pub async fn own_address(directory: &dyn PeerDirectory, hostname: &str) -> Result<IpAddr> {
    directory
        .resolve_host(hostname)
        .await?
        .ok_or_else(|| Error::InvalidConfig(format!("own hostname {} does not resolve", hostname)))
}

/// Startup barrier: wait until this member is published under `service`.
///
/// Lookups that fail or do not include `self_addr` are retried per `policy`;
/// only budget exhaustion yields `DiscoveryUnavailable`.
pub async fn wait_until_visible(
    directory: &dyn PeerDirectory,
    service: &str,
    self_addr: IpAddr,
    policy: RetryPolicy,
) -> Result<ClusterView> {
    let result = retry_with_backoff(policy, move || async move {
        let members = directory.resolve(service).await?;
        let view = ClusterView::new(members, self_addr);
        if view.self_visible {
            Ok(view)
        } else {
            tracing::debug!(
                service,
                %self_addr,
                visible = view.members.len(),
                "Not yet published in discovery"
            );
            Err(Error::Timeout(format!("{} not in {}", self_addr, service)))
        }
    })
    .await;

    match result {
        Ok(view) => {
            tracing::info!(
                service,
                %self_addr,
                members = view.members.len(),
                "Visible in discovery"
            );
            Ok(view)
        }
        Err(e) if e.is_retryable() => Err(Error::DiscoveryUnavailable {
            service: service.to_string(),
            address: self_addr.to_string(),
            attempts: policy.attempts,
        }),
        Err(e) => Err(e),
    }
}
