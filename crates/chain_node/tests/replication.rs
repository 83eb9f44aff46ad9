//! Replication and deterministic-apply behavior with a partitioned follower.
//!
//! Test flow:
//! 1) Steer leadership to the stake-2000 node of a [1000, 2000, 500] set.
//! 2) Partition the stake-500 follower; the remaining pair still exceeds
//!    two-thirds of total stake.
//! 3) Commit transfers through the leader and verify the connected nodes
//!    converge to the identical ledger digest.
//! 4) Reconnect the lagging follower and verify it catches up to the same
//!    digest via log replay.

mod common;

use common::{ensure_leader, fast_cluster, weighted_members, transfer, WAIT};

use chain_raft::raft::StateMachine;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commits_on_stake_quorum_and_catches_up_follower() {
    let cluster = fast_cluster(weighted_members()).build().await.unwrap();
    let leader = ensure_leader(&cluster, 2).await;
    let leader_id = leader.node_id();

    let lagging = 3;
    cluster.partition(lagging);

    // Three transfers commit on the connected pair's stake (3000 of 3500).
    let mut ids = Vec::new();
    for nonce in 1..=3u64 {
        let tx = transfer(10 * nonce, nonce);
        ids.push(tx.id);
        leader.mempool().submit(tx).unwrap();
    }
    for id in &ids {
        cluster.wait_tx_applied(leader_id, id, WAIT).await.unwrap();
    }

    let committed = leader.last_applied().await;
    assert!(committed >= 1);
    cluster.wait_for_applied(committed, WAIT).await.unwrap();

    let leader_node = cluster.node(leader_id).unwrap();
    assert_eq!(leader_node.ledger.balance("bob"), 60);

    // Connected nodes agree; the partitioned one is still at genesis.
    let digests = cluster.digests();
    let leader_digest = digests.iter().find(|(id, _)| *id == leader_id).unwrap().1;
    for (id, digest) in &digests {
        if *id == lagging {
            assert_ne!(*digest, leader_digest, "partitioned node saw the batch");
        } else {
            assert_eq!(*digest, leader_digest, "connected node {id} diverged");
        }
    }
    assert_eq!(cluster.node(lagging).unwrap().ledger.balance("bob"), 0);

    // Reconnect: incremental AppendEntries replay brings the follower to
    // the identical state.
    cluster.reconnect(lagging);
    cluster.wait_for_applied(committed, WAIT).await.unwrap();
    let lagging_node = cluster.node(lagging).unwrap();
    assert_eq!(lagging_node.ledger.balance("bob"), 60);
    assert_eq!(lagging_node.ledger.digest(), leader_digest);

    cluster.shutdown();
}

/// Commit index never regresses on any node while traffic flows.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commit_index_is_monotonic() {
    let cluster = fast_cluster(weighted_members()).build().await.unwrap();
    let leader = cluster.wait_for_leader(WAIT).await.unwrap();
    let leader_id = leader.node_id();

    let mut floors = vec![0u64; cluster.nodes().len()];
    for nonce in 1..=5u64 {
        let tx = transfer(1, nonce);
        let id = tx.id;
        leader.mempool().submit(tx).unwrap();
        cluster.wait_tx_applied(leader_id, &id, WAIT).await.unwrap();
        for (slot, node) in cluster.nodes().iter().enumerate() {
            let commit = node.coordinator.commit_index().await;
            assert!(
                commit >= floors[slot],
                "commit index regressed on node {}",
                node.coordinator.node_id()
            );
            floors[slot] = commit;
        }
    }

    cluster.shutdown();
}
