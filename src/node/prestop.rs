//! Data process pre-stop hook
//!
//! Waits for the monitors to move the master role away from this node. The
//! hook only observes; the monitor agent's own pre-stop triggers the
//! failover.

use crate::common::{poll_until, NodeAddr, Role};
use crate::protocol::DataPlane;
use std::time::Duration;

/// Poll the local node's role until it is no longer master.
///
/// Returns true when the node is (or becomes) a non-master within `timeout`.
/// A node that does not answer has nothing left to hand over and counts as
/// demoted.
pub async fn wait_for_demotion(
    data_plane: &dyn DataPlane,
    local: &NodeAddr,
    timeout: Duration,
    interval: Duration,
) -> bool {
    let demoted = move || async move {
        match data_plane.role(local).await {
            Ok(info) => info.role != Role::Master,
            Err(e) => {
                tracing::debug!(node = %local, error = %e, "Role query failed");
                true
            }
        }
    };

    if demoted().await {
        return true;
    }

    tracing::info!(node = %local, ?timeout, "Waiting for the monitors to fail over");
    let done = poll_until(timeout, interval, demoted).await;
    if done {
        tracing::info!(node = %local, "Node is no longer master");
    } else {
        tracing::warn!(node = %local, ?timeout, "Node still master after pre-stop budget");
    }
    done
}
