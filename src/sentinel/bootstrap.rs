//! Monitor agent bootstrap
//!
//! Builds an agent's [`MonitorConfig`] from its hostname, the master the
//! member resolved at startup and whatever peers discovery can see right now.
//! Every step can be re-run; registration is keyed, so repeats change
//! nothing.

use super::config::MonitorConfig;
use crate::common::{ClusterConfig, MonitorId, NodeAddr, Result, SentinelSettings};
use crate::discovery::PeerDirectory;

/// Identity, initial target and settings of a fresh agent
pub fn initial_config(
    cluster: &ClusterConfig,
    settings: &SentinelSettings,
    hostname: &str,
    master: NodeAddr,
    password: Option<String>,
) -> MonitorConfig {
    let announce = NodeAddr::new(cluster.full_hostname(hostname), cluster.sentinel_port);
    MonitorConfig::new(
        MonitorId::from_hostname(hostname),
        cluster.name.clone(),
        master,
        settings.clone(),
        announce,
    )
    .with_password(password)
}

/// Register every resolvable member `0..cluster.size` as a known replica and,
/// except this one, as a known peer agent. Returns the number of new entries.
pub async fn register_peers(
    config: &mut MonitorConfig,
    cluster: &ClusterConfig,
    directory: &dyn PeerDirectory,
    hostname: &str,
) -> Result<usize> {
    let mut added = 0;
    for ordinal in 0..cluster.size {
        let peer = cluster.member_hostname(ordinal);
        let is_self = peer.eq_ignore_ascii_case(hostname);
        let full = cluster.full_hostname(&peer);
        let ip = match directory.resolve_host(&full).await? {
            Some(ip) => ip,
            None => {
                tracing::debug!(peer = %full, "Peer does not resolve yet, skipping");
                continue;
            }
        };

        let is_master = config.master.same_host(&full) || config.master.same_host(&ip.to_string());
        if !is_master && !is_self {
            let addr = NodeAddr::new(full.clone(), cluster.sentinel_port);
            if config.add_known_sentinel(MonitorId::from_hostname(&peer), addr) {
                tracing::info!(peer = %full, "Registered known sentinel");
                added += 1;
            }
        }

        let replica = NodeAddr::new(full.clone(), cluster.data_port);
        if replica != config.master && config.add_known_replica(replica) {
            tracing::info!(peer = %full, "Registered known replica");
            added += 1;
        }
    }
    Ok(added)
}

/// Full bootstrap: initial configuration plus one registration pass
pub async fn bootstrap(
    cluster: &ClusterConfig,
    settings: &SentinelSettings,
    directory: &dyn PeerDirectory,
    hostname: &str,
    master: NodeAddr,
    password: Option<String>,
) -> Result<MonitorConfig> {
    let mut config = initial_config(cluster, settings, hostname, master, password);
    let added = register_peers(&mut config, cluster, directory, hostname).await?;
    tracing::info!(
        my_id = %config.my_id,
        master = %config.master,
        registered = added,
        "Monitor configuration bootstrapped"
    );
    Ok(config)
}
