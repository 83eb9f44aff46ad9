//! In-process multi-node cluster harness.
//!
//! Builds a full validator set wired through the `Router` transport, with a
//! shared genesis ledger and either in-memory or file-backed log stores.
//! Used by the devnet binary, the workload generator, and the integration
//! tests; fault injection happens through the router's partition controls.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::time;

use chain_raft::advisors::Advisors;
use chain_raft::raft::{
    Config, Coordinator, LogIndex, LogStore, Member, MemoryLog, MemorySnapshotStore, NodeId, Role,
    SnapshotStore, TxnId,
};

use crate::ledger::Ledger;
use crate::log::{FileLog, FileSnapshotStore};
use crate::transport::{Router, RouterTransport};

/// Parse a validator set spec like `1:1000,2:2000,3:500` (id:stake).
pub fn parse_members(spec: &str) -> anyhow::Result<Vec<Member>> {
    let mut members = Vec::new();
    for part in spec.split(',').filter(|p| !p.trim().is_empty()) {
        let (id, stake) = part
            .trim()
            .split_once(':')
            .with_context(|| format!("member `{part}` is not id:stake"))?;
        members.push(Member {
            id: id.trim().parse().with_context(|| format!("bad node id in `{part}`"))?,
            stake: stake
                .trim()
                .parse()
                .with_context(|| format!("bad stake in `{part}`"))?,
        });
    }
    anyhow::ensure!(!members.is_empty(), "member spec is empty");
    Ok(members)
}

/// One running node plus the handles the harness exposes for inspection.
pub struct ClusterNode {
    pub coordinator: Arc<Coordinator>,
    pub ledger: Arc<Ledger>,
    /// Present only for durable clusters.
    pub wal: Option<Arc<FileLog>>,
}

pub struct ClusterBuilder {
    members: Vec<Member>,
    balances: Vec<(String, u64)>,
    data_dir: Option<PathBuf>,
    advisors: Advisors,
    tune: Option<Box<dyn Fn(&mut Config) + Send + Sync>>,
}

impl ClusterBuilder {
    pub fn new(members: Vec<Member>) -> Self {
        Self {
            members,
            balances: Vec::new(),
            data_dir: None,
            advisors: Advisors::default(),
            tune: None,
        }
    }

    /// Genesis balances shared by every node's ledger.
    pub fn balances(mut self, balances: impl IntoIterator<Item = (String, u64)>) -> Self {
        self.balances = balances.into_iter().collect();
        self
    }

    /// Use file-backed logs under `dir` (one `node-<id>` subdirectory each).
    pub fn durable(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn advisors(mut self, advisors: Advisors) -> Self {
        self.advisors = advisors;
        self
    }

    /// Adjust each node's config before construction (timeouts, batch
    /// bounds, analyzer strategy). Applied identically to every node so
    /// cluster-wide invariants stay cluster-wide.
    pub fn tune(mut self, f: impl Fn(&mut Config) + Send + Sync + 'static) -> Self {
        self.tune = Some(Box::new(f));
        self
    }

    /// Construct, recover, and start every node.
    pub async fn build(self) -> anyhow::Result<Cluster> {
        let router = Router::new();
        let mut nodes = Vec::with_capacity(self.members.len());
        for member in &self.members {
            let mut config = Config::new(member.id, self.members.clone());
            if let Some(tune) = &self.tune {
                tune(&mut config);
            }

            let ledger = Arc::new(Ledger::with_balances(self.balances.iter().cloned()));
            let transport = Arc::new(RouterTransport::new(router.clone(), member.id));

            let (log_store, snapshot_store, wal): (
                Arc<dyn LogStore>,
                Arc<dyn SnapshotStore>,
                Option<Arc<FileLog>>,
            ) = match &self.data_dir {
                Some(dir) => {
                    let node_dir = dir.join(format!("node-{}", member.id));
                    let wal = Arc::new(
                        FileLog::open_dir(&node_dir)
                            .with_context(|| format!("open log for node {}", member.id))?,
                    );
                    let snaps = Arc::new(FileSnapshotStore::open_dir(&node_dir)?);
                    (wal.clone(), snaps, Some(wal))
                }
                None => (
                    Arc::new(MemoryLog::new()),
                    Arc::new(MemorySnapshotStore::new()),
                    None,
                ),
            };

            let coordinator = Coordinator::new(
                config,
                transport,
                log_store,
                snapshot_store,
                ledger.clone(),
                self.advisors.clone(),
            )?;
            coordinator
                .recover()
                .await
                .with_context(|| format!("recover node {}", member.id))?;
            router.register(coordinator.clone());
            nodes.push(ClusterNode {
                coordinator,
                ledger,
                wal,
            });
        }

        for node in &nodes {
            node.coordinator.start();
        }
        Ok(Cluster { router, nodes })
    }
}

pub struct Cluster {
    router: Arc<Router>,
    nodes: Vec<ClusterNode>,
}

impl Cluster {
    pub fn nodes(&self) -> &[ClusterNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&ClusterNode> {
        self.nodes.iter().find(|n| n.coordinator.node_id() == id)
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn partition(&self, id: NodeId) {
        self.router.partition(id);
    }

    pub fn reconnect(&self, id: NodeId) {
        self.router.reconnect(id);
    }

    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.coordinator.shutdown();
        }
    }

    /// Wait until a connected node reports LEADER and return it.
    pub async fn wait_for_leader(&self, timeout: Duration) -> anyhow::Result<Arc<Coordinator>> {
        let deadline = time::Instant::now() + timeout;
        loop {
            for node in &self.nodes {
                let id = node.coordinator.node_id();
                if !self.router.is_partitioned(id)
                    && node.coordinator.role().await == Role::Leader
                {
                    return Ok(node.coordinator.clone());
                }
            }
            anyhow::ensure!(
                time::Instant::now() < deadline,
                "no leader elected within {timeout:?}"
            );
            time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until every connected node has applied up to `index`.
    pub async fn wait_for_applied(&self, index: LogIndex, timeout: Duration) -> anyhow::Result<()> {
        let deadline = time::Instant::now() + timeout;
        loop {
            let mut lagging = None;
            for node in &self.nodes {
                let id = node.coordinator.node_id();
                if self.router.is_partitioned(id) {
                    continue;
                }
                if node.coordinator.last_applied().await < index {
                    lagging = Some(id);
                    break;
                }
            }
            let Some(lagging) = lagging else {
                return Ok(());
            };
            anyhow::ensure!(
                time::Instant::now() < deadline,
                "node {lagging} did not apply index {index} within {timeout:?}"
            );
            time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until `node_id` no longer holds `txn` in its mempool, meaning a
    /// committed batch containing it has been applied there.
    pub async fn wait_tx_applied(
        &self,
        node_id: NodeId,
        txn: &TxnId,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        let node = self
            .node(node_id)
            .with_context(|| format!("unknown node {node_id}"))?;
        let deadline = time::Instant::now() + timeout;
        while node.coordinator.mempool().contains(txn) {
            anyhow::ensure!(
                time::Instant::now() < deadline,
                "transaction {txn:?} not applied on node {node_id} within {timeout:?}"
            );
            time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    /// Ledger digest per node, for convergence assertions.
    pub fn digests(&self) -> Vec<(NodeId, [u8; 32])> {
        self.nodes
            .iter()
            .map(|n| {
                use chain_raft::raft::StateMachine;
                (n.coordinator.node_id(), n.ledger.digest())
            })
            .collect()
    }
}
