//! In-process transport between coordinators.
//!
//! `Router` holds every coordinator of an in-process cluster; a
//! `RouterTransport` delivers consensus RPCs as direct async calls into the
//! target's handlers. Nodes can be partitioned from the rest of the cluster
//! and reconnected later, which is how the integration tests and the
//! workload harness exercise failover and catch-up paths.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;

use chain_raft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, Coordinator, InstallSnapshotRequest,
    InstallSnapshotResponse, NodeId, Transport, VoteRequest, VoteResponse,
};

/// Registry of in-process nodes plus the current partition set.
pub struct Router {
    nodes: RwLock<HashMap<NodeId, Arc<Coordinator>>>,
    cut: RwLock<HashSet<NodeId>>,
    /// Artificial delivery delay ahead of each handler invocation. Direct
    /// in-process calls otherwise complete inline, which hides the message
    /// races (simultaneous candidacies, crossed votes) a real network has.
    handler_delay: RwLock<Option<Duration>>,
}

impl Router {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: RwLock::new(HashMap::new()),
            cut: RwLock::new(HashSet::new()),
            handler_delay: RwLock::new(None),
        })
    }

    pub fn set_handler_delay(&self, delay: Option<Duration>) {
        *self.handler_delay.write().expect("router lock") = delay;
    }

    pub fn register(&self, node: Arc<Coordinator>) {
        self.nodes
            .write()
            .expect("router lock")
            .insert(node.node_id(), node);
    }

    /// Cut a node off from every peer (both directions).
    pub fn partition(&self, id: NodeId) {
        self.cut.write().expect("router lock").insert(id);
        tracing::info!(node = id, "partitioned node");
    }

    pub fn reconnect(&self, id: NodeId) {
        self.cut.write().expect("router lock").remove(&id);
        tracing::info!(node = id, "reconnected node");
    }

    pub fn is_partitioned(&self, id: NodeId) -> bool {
        self.cut.read().expect("router lock").contains(&id)
    }

    async fn route(&self, from: NodeId, to: NodeId) -> anyhow::Result<Arc<Coordinator>> {
        let delay = *self.handler_delay.read().expect("router lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        // The partition check runs after the delivery delay so a cut that
        // lands while a message is "in flight" drops it, as a network would.
        {
            let cut = self.cut.read().expect("router lock");
            anyhow::ensure!(
                !cut.contains(&from) && !cut.contains(&to),
                "link {from} -> {to} is partitioned"
            );
        }
        self.nodes
            .read()
            .expect("router lock")
            .get(&to)
            .cloned()
            .with_context(|| format!("unknown peer {to}"))
    }
}

/// `Transport` handle bound to one origin node.
pub struct RouterTransport {
    origin: NodeId,
    router: Arc<Router>,
}

impl RouterTransport {
    pub fn new(router: Arc<Router>, origin: NodeId) -> Self {
        Self { origin, router }
    }
}

#[async_trait]
impl Transport for RouterTransport {
    async fn request_vote(
        &self,
        target: NodeId,
        req: VoteRequest,
    ) -> anyhow::Result<VoteResponse> {
        let node = self.router.route(self.origin, target).await?;
        Ok(node.rpc_request_vote(req).await)
    }

    async fn append_entries(
        &self,
        target: NodeId,
        req: AppendEntriesRequest,
    ) -> anyhow::Result<AppendEntriesResponse> {
        let node = self.router.route(self.origin, target).await?;
        Ok(node.rpc_append_entries(req).await)
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        req: InstallSnapshotRequest,
    ) -> anyhow::Result<InstallSnapshotResponse> {
        let node = self.router.route(self.origin, target).await?;
        Ok(node.rpc_install_snapshot(req).await)
    }
}
