//! Snapshot-based fast catch-up for a far-behind follower.
//!
//! Test flow:
//! 1) Partition one follower of a three-node cluster.
//! 2) Commit more batches than the snapshot lag threshold allows a follower
//!    to fall behind.
//! 3) Reconnect the follower; the leader ships a state snapshot instead of
//!    replaying the whole log.
//! 4) Verify the follower reaches the leader's exact digest and that a
//!    snapshot install (not just log replay) actually happened.

mod common;

use std::time::Duration;

use common::{ensure_leader, fast_config, weighted_members, transfer, WAIT};

use chain_node::ClusterBuilder;
use chain_raft::raft::StateMachine;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lagging_follower_is_restored_from_snapshot() {
    let cluster = ClusterBuilder::new(weighted_members())
        .balances([("alice".to_string(), 1_000_000), ("bob".to_string(), 0)])
        .tune(|cfg| {
            fast_config(cfg);
            cfg.snapshot_lag_threshold = 4;
        })
        .build()
        .await
        .unwrap();

    // The stake-2000 node leads so the stake-500 follower can drop out
    // without costing quorum.
    let leader = ensure_leader(&cluster, 2).await;
    let leader_id = leader.node_id();
    let lagging = 3;
    cluster.partition(lagging);

    // Fall well past the lag threshold while the follower is away.
    for nonce in 1..=10u64 {
        let tx = transfer(10, nonce);
        let id = tx.id;
        leader.mempool().submit(tx).unwrap();
        cluster.wait_tx_applied(leader_id, &id, WAIT).await.unwrap();
    }
    let target = leader.last_applied().await;
    let leader_digest = cluster.node(leader_id).unwrap().ledger.digest();

    cluster.reconnect(lagging);
    let follower = cluster.node(lagging).unwrap();
    let deadline = tokio::time::Instant::now() + WAIT;
    while follower.coordinator.last_applied().await < target {
        assert!(
            tokio::time::Instant::now() < deadline,
            "follower never caught up past the snapshot floor"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(follower.ledger.digest(), leader_digest);
    assert_eq!(follower.ledger.balance("bob"), 100);
    assert!(
        follower.coordinator.debug_stats().await.snapshots_installed >= 1,
        "catch-up happened without a snapshot install"
    );
    assert!(leader.debug_stats().await.snapshots_sent >= 1);

    cluster.shutdown();
}
