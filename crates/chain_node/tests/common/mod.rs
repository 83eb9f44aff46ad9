//! Shared helpers for in-process cluster tests.

use std::sync::Arc;
use std::time::Duration;

use chain_node::{Cluster, ClusterBuilder, TxCommand};
use chain_raft::raft::{Config, Coordinator, Member, NodeId, Transaction};

/// Timeout for cluster-level waits (elections, convergence).
pub const WAIT: Duration = Duration::from_secs(5);

/// Equal-stake validator set. Note that under the strict two-thirds stake
/// quorum no pair of these nodes can commit alone, so this set suits
/// election-only tests.
pub fn equal_members() -> Vec<Member> {
    vec![
        Member { id: 1, stake: 100 },
        Member { id: 2, stake: 100 },
        Member { id: 3, stake: 100 },
    ]
}

/// Weighted validator set: any pair containing the stake-2000 node clears
/// the two-thirds stake quorum (2334 of 3500), so one small node can fail
/// without stalling commits.
pub fn weighted_members() -> Vec<Member> {
    vec![
        Member { id: 1, stake: 1000 },
        Member { id: 2, stake: 2000 },
        Member { id: 3, stake: 500 },
    ]
}

/// Steer leadership to `id`. Only valid before any traffic: a candidacy
/// can only win while every log is still equally fresh.
pub async fn ensure_leader(cluster: &Cluster, id: NodeId) -> Arc<Coordinator> {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let leader = cluster.wait_for_leader(WAIT).await.expect("no leader");
        if leader.node_id() == id {
            return leader;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "could not steer leadership to node {id}"
        );
        cluster
            .node(id)
            .expect("missing node")
            .coordinator
            .trigger_election()
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Timeouts tightened for in-process tests.
pub fn fast_config(cfg: &mut Config) {
    cfg.election_timeout_min = Duration::from_millis(50);
    cfg.election_timeout_max = Duration::from_millis(150);
    cfg.heartbeat_interval = Duration::from_millis(20);
    cfg.rpc_timeout = Duration::from_millis(100);
    cfg.propose_timeout = Duration::from_secs(2);
    cfg.leader_lease_timeout = Duration::from_millis(300);
}

/// Cluster builder with fast timeouts and a funded sender account.
pub fn fast_cluster(members: Vec<Member>) -> ClusterBuilder {
    ClusterBuilder::new(members)
        .balances([("alice".to_string(), 1_000_000), ("bob".to_string(), 0)])
        .tune(fast_config)
}

/// Unsigned transfer transaction from `alice` to `bob`.
pub fn transfer(amount: u64, nonce: u64) -> Transaction {
    TxCommand::Transfer {
        from: "alice".into(),
        to: "bob".into(),
        amount,
        nonce,
    }
    .into_transaction()
    .expect("encode transfer")
}
