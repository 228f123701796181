//! Quorum-based down detection and automatic failover

mod common;

use common::*;
use kvsentinel::protocol::MonitorQuorum;
use kvsentinel::sentinel::{FailoverMachine, FailoverState};
use kvsentinel::{MonitorId, NodeAddr, Role};
use std::time::Duration;
use tokio::time::Instant;

const TICK: Duration = Duration::from_millis(250);

#[tokio::test]
async fn test_objectively_down_needs_full_quorum() {
    for size in 1..=5usize {
        for quorum in 1..=size {
            let ids: Vec<MonitorId> = (0..size)
                .map(|i| MonitorId::from_hostname(&format!("redis-node-{}", i)))
                .collect();
            let t0 = Instant::now();
            let now = t0 + Duration::from_secs(2);

            let machine_with = |suspecting: usize| {
                let mut machine = FailoverMachine::new(
                    ids[0].clone(),
                    NodeAddr::new("redis-node-0.svc", 6379),
                    quorum,
                    Duration::from_secs(1),
                    Duration::from_secs(10),
                    t0,
                );
                if suspecting == 0 {
                    machine.observe_master(true, now);
                }
                for (i, peer) in ids.iter().enumerate().skip(1) {
                    machine.record_opinion(peer.clone(), i < suspecting, now);
                }
                machine
            };

            let mut below = machine_with(quorum - 1);
            for _ in 0..4 {
                below.evaluate(now);
            }
            assert!(
                !below.is_objectively_down() && !below.in_progress(),
                "{} of {} with quorum {}",
                quorum - 1,
                size,
                quorum
            );

            let mut at = machine_with(quorum);
            at.evaluate(now);
            at.evaluate(now);
            assert!(
                at.is_objectively_down(),
                "{} of {} with quorum {}",
                quorum,
                size,
                quorum
            );
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_single_suspicion_never_promotes() {
    let fleet = Fleet::with_master(3, 2, &[0, 100, 90]).await;
    // Only agent 1 loses the master
    fleet.views[1].block(&fleet.data(0));

    fleet.run_rounds(12, TICK).await;

    let suspecting = fleet.agents[1].state();
    assert_eq!(*suspecting.machine().state(), FailoverState::SuspectedDown);
    assert_eq!(suspecting.machine().agreeing(Instant::now()), 1);

    assert_eq!(fleet.data_masters(), vec![fleet.data(0)]);
    assert_eq!(fleet.node(1).master, Some(fleet.data(0)));
    assert_eq!(fleet.node(2).master, Some(fleet.data(0)));
    for agent in &fleet.agents {
        let master = agent.state().master_addr(NAME).await.unwrap();
        assert_eq!(master, Some(fleet.data(0)));
    }
    assert_eq!(fleet.epochs(), vec![0, 0, 0]);
}

#[tokio::test(start_paused = true)]
async fn test_quorum_promotes_most_advanced_replica() {
    let fleet = Fleet::with_master(3, 2, &[0, 100, 250]).await;
    fleet.run_rounds(2, TICK).await;

    fleet.stop_node(0);
    fleet.run_rounds(12, TICK).await;

    let promoted = fleet.data(2);
    assert_eq!(fleet.data_masters(), vec![promoted.clone()]);
    assert_eq!(fleet.node(1).role, Role::Replica);
    assert_eq!(fleet.node(1).master, Some(promoted.clone()));
    assert!(fleet
        .reported_masters()
        .iter()
        .all(|master| *master == promoted));

    let epochs = fleet.epochs();
    assert!(epochs[0] >= 1);
    assert!(epochs.iter().all(|e| *e == epochs[0]));

    let config = fleet.agents[1].state().config();
    assert_eq!(config.master, promoted);
    assert!(config.replicas().contains(&fleet.data(0)));
}

#[tokio::test(start_paused = true)]
async fn test_recovered_master_cancels_suspicion() {
    // Agent 1 only hears from agent 2, so a quorum of 3 is never reached
    let fleet = Fleet::with_master(3, 3, &[0, 100, 90]).await;
    fleet.views[1].block(&fleet.data(0));
    fleet.views[2].block(&fleet.data(0));

    fleet.run_rounds(8, TICK).await;
    for ordinal in [1, 2] {
        let state = fleet.agents[ordinal].state();
        assert_eq!(*state.machine().state(), FailoverState::SuspectedDown);
        assert_eq!(state.master_flags(), "master,s_down");
    }

    fleet.views[1].unblock(&fleet.data(0));
    fleet.views[2].unblock(&fleet.data(0));
    fleet.tick_all().await;

    assert!(fleet
        .agents
        .iter()
        .all(|a| *a.state().machine().state() == FailoverState::MasterAlive));
    assert_eq!(fleet.data_masters(), vec![fleet.data(0)]);
    assert_eq!(fleet.epochs(), vec![0, 0, 0]);
}

#[tokio::test(start_paused = true)]
async fn test_master_hidden_during_automatic_failover() {
    let fleet = Fleet::with_master(3, 2, &[0, 100, 250]).await;
    fleet.run_rounds(2, TICK).await;
    fleet.stop_node(0);

    // Only the highest identity supervises, so it follows a leader that
    // never gets to promote
    let follower = (0..3)
        .max_by_key(|&i| MonitorId::from_hostname(&hostname(&fleet.cluster, i)))
        .unwrap();
    let state = fleet.agents[follower].state();
    let mut in_progress = false;
    for _ in 0..20 {
        fleet.agents[follower].supervisor().tick().await;
        in_progress = matches!(
            state.machine().state(),
            FailoverState::FailoverInProgress { manual: false, .. }
        );
        if in_progress {
            break;
        }
        tokio::time::sleep(TICK).await;
    }

    assert!(in_progress);
    assert_eq!(state.master_addr(NAME).await.unwrap(), None);
    assert_eq!(
        state.master_flags(),
        "master,s_down,o_down,failover_in_progress"
    );
    assert_eq!(fleet.data_masters(), Vec::<NodeAddr>::new());
}
