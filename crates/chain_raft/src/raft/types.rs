//! Shared types for the HyperRAFT++ consensus engine.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by both the consensus engine and the transport/state-machine layers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Logical node identifier within the validator set.
pub type NodeId = u64;
/// Monotonic election term.
pub type Term = u64;
/// Position of an entry in the replicated log (1-based, contiguous).
pub type LogIndex = u64;

/// Role of a node in the consensus state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// A validator and its stake weight.
///
/// Stake is the vote weight for quorum evaluation and the leader-election
/// tie-break. It is read-only to the engine; staking operations update it
/// out of band between deployments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    pub stake: u64,
}

/// Content-derived transaction identifier (BLAKE3 of access set + payload).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(pub [u8; 32]);

impl fmt::Debug for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:")?;
        for b in &self.0[..6] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Content-derived batch identifier (BLAKE3 over the ordered txn ids).
///
/// The id is the idempotency token: re-proposing a batch after a timeout or
/// leader change resolves to the already-logged entry instead of creating a
/// second one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchId(pub [u8; 32]);

impl fmt::Debug for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch:")?;
        for b in &self.0[..6] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Keys a transaction declares it will read and write.
///
/// The declaration is made before execution; touching a key outside of it
/// during execution is a consensus-safety bug, not a runtime condition.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessKeys {
    pub reads: Vec<Vec<u8>>,
    pub writes: Vec<Vec<u8>>,
}

impl AccessKeys {
    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.reads.iter().chain(self.writes.iter())
    }

    /// True when `touched` stays within this declaration: every touched
    /// write key must be a declared write, every touched read key a declared
    /// read or write.
    pub fn covers(&self, touched: &AccessKeys) -> bool {
        touched
            .writes
            .iter()
            .all(|k| self.writes.iter().any(|d| d == k))
            && touched
                .reads
                .iter()
                .all(|k| self.reads.iter().any(|d| d == k) || self.writes.iter().any(|d| d == k))
    }
}

/// A client transaction as held in the mempool and replicated in batches.
///
/// The payload is opaque to the consensus layer; the state machine decodes
/// and validates it at apply time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxnId,
    pub access: AccessKeys,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Transaction {
    /// Build a transaction, deriving the id from its content.
    pub fn new(access: AccessKeys, payload: Vec<u8>, signature: Vec<u8>) -> Self {
        let id = Self::content_id(&access, &payload);
        Self {
            id,
            access,
            payload,
            signature,
        }
    }

    /// Content hash used as the transaction id.
    pub fn content_id(access: &AccessKeys, payload: &[u8]) -> TxnId {
        let mut hasher = blake3::Hasher::new();
        for key in &access.reads {
            hasher.update(&(key.len() as u32).to_le_bytes());
            hasher.update(key);
        }
        hasher.update(b"|");
        for key in &access.writes {
            hasher.update(&(key.len() as u32).to_le_bytes());
            hasher.update(key);
        }
        hasher.update(b"|");
        hasher.update(payload);
        TxnId(*hasher.finalize().as_bytes())
    }

    /// Approximate replication size, used for batch byte budgeting.
    pub fn encoded_len(&self) -> usize {
        let keys: usize = self.access.keys().map(|k| k.len() + 4).sum();
        32 + keys + self.payload.len() + self.signature.len()
    }
}

/// An ordered, immutable group of transactions proposed together.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub proposer: NodeId,
    pub term: Term,
    pub txns: Vec<Transaction>,
}

impl Batch {
    pub fn new(proposer: NodeId, term: Term, txns: Vec<Transaction>) -> Self {
        let id = Self::content_id(&txns);
        Self {
            id,
            proposer,
            term,
            txns,
        }
    }

    /// Batch id over the ordered txn ids only. Proposer and term are
    /// metadata: a re-proposal by a new leader keeps the same id.
    pub fn content_id(txns: &[Transaction]) -> BatchId {
        let mut hasher = blake3::Hasher::new();
        for tx in txns {
            hasher.update(&tx.id.0);
        }
        BatchId(*hasher.finalize().as_bytes())
    }

    pub fn encoded_len(&self) -> usize {
        self.txns.iter().map(Transaction::encoded_len).sum()
    }
}

/// A replicated log entry carrying one batch.
///
/// Commit status is positional: the coordinator tracks a commit index and an
/// applied index rather than mutating entries in place, which keeps the
/// durable log append-only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub batch: Batch,
}

/// Per-transaction execution outcome inside a committed batch.
///
/// A rejection is a business-level result (insufficient balance, malformed
/// payload) recorded in the batch result; it never fails the batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOutcome {
    Applied,
    Rejected { reason: String },
}

/// What the state machine reports back for one applied transaction.
#[derive(Clone, Debug)]
pub struct TxApply {
    pub outcome: TxOutcome,
    /// Keys actually touched; the executor checks them against the declared
    /// access set.
    pub touched: AccessKeys,
}

/// Deterministic result of applying one batch.
///
/// Every node computes an identical `BatchResult` for the same prior state
/// and batch; `state_digest` is the ledger digest after the batch and is
/// what replication tests compare across nodes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: BatchId,
    pub outcomes: Vec<TxOutcome>,
    pub state_digest: [u8; 32],
}

/// Durable (term, voted-for) pair.
///
/// Must be persisted before a vote response leaves the node: a crash after
/// voting but before persisting would otherwise allow a double vote in the
/// same term.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
}

/// Opaque state-machine snapshot plus the log position it covers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotHandle {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub state: Vec<u8>,
}

/// Durable, append-only log of committed entries.
///
/// `append` must not return success before the entry is durable
/// (fsync-equivalent), and implementations must never reorder or lose an
/// appended entry. Only committed entries reach this store; tentative
/// entries live in the coordinator's in-memory tail.
pub trait LogStore: Send + Sync + 'static {
    /// Append a committed entry, returning its storage offset.
    fn append(&self, entry: &LogEntry) -> anyhow::Result<u64>;
    /// Read entries with `from <= index <= to`, in index order.
    fn read_range(&self, from: LogIndex, to: LogIndex) -> anyhow::Result<Vec<LogEntry>>;
    fn last_index(&self) -> anyhow::Result<Option<LogIndex>>;
    fn last_term(&self) -> anyhow::Result<Option<Term>>;
    fn save_hard_state(&self, hs: &HardState) -> anyhow::Result<()>;
    fn load_hard_state(&self) -> anyhow::Result<Option<HardState>>;
}

/// Durable home for the latest installed/created snapshot.
pub trait SnapshotStore: Send + Sync + 'static {
    fn save(&self, snapshot: &SnapshotHandle) -> anyhow::Result<()>;
    fn load(&self) -> anyhow::Result<Option<SnapshotHandle>>;
}

/// Application state machine driven by the executor.
///
/// The consensus layer treats payloads as opaque bytes; `apply` decodes,
/// validates, and mutates state for one transaction and reports the keys it
/// actually touched. `snapshot`/`restore` implement follower fast-catch-up
/// and crash recovery; `digest` must be deterministic over logical state.
pub trait StateMachine: Send + Sync + 'static {
    fn apply(&self, tx: &Transaction) -> TxApply;
    fn snapshot(&self) -> anyhow::Result<Vec<u8>>;
    fn restore(&self, state: &[u8]) -> anyhow::Result<()>;
    fn digest(&self) -> [u8; 32];
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate: NodeId,
    /// Stake the candidate declares for tie-break evaluation.
    pub candidate_stake: u64,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub granted: bool,
    pub voter: NodeId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// Highest index known replicated on the responder when `success`;
    /// otherwise a hint for the leader's next probe.
    pub match_index: LogIndex,
    pub from: NodeId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader: NodeId,
    pub snapshot: SnapshotHandle,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub ok: bool,
}

/// Transport interface for consensus RPCs.
///
/// The engine is transport-agnostic; concrete implementations can use
/// sockets, in-memory routers, or test harnesses. Delivery is at-least-once
/// with idempotent handling on the receiving side.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request_vote(&self, target: NodeId, req: VoteRequest)
        -> anyhow::Result<VoteResponse>;

    async fn append_entries(
        &self,
        target: NodeId,
        req: AppendEntriesRequest,
    ) -> anyhow::Result<AppendEntriesResponse>;

    async fn install_snapshot(
        &self,
        target: NodeId,
        req: InstallSnapshotRequest,
    ) -> anyhow::Result<InstallSnapshotResponse>;
}

/// Errors surfaced by the proposal path.
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("not the leader (known leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },
    #[error("leadership changed at term {term} while the proposal was in flight")]
    LeaderChanged { term: Term },
    #[error("no quorum for index {index} ({batch:?}) within the proposal window")]
    QuorumTimeout { index: LogIndex, batch: BatchId },
    #[error("coordinator is shut down")]
    Stopped,
}

/// Per-group configuration and operational tuning.
///
/// Timeouts guard against slow/failed peers; batch bounds cap worst-case
/// proposal latency and replication payload size. The analyzer strategy is
/// a cluster-wide invariant: every node of a deployment must share it so
/// followers replay batches with the leader's grouping.
#[derive(Clone, Debug)]
pub struct Config {
    pub node_id: NodeId,
    pub members: Vec<Member>,

    /// Election timeout is drawn uniformly from `[min, max)` per cycle.
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    /// Upper bound for point-to-point RPC waits used by protocol steps.
    pub rpc_timeout: Duration,
    /// End-to-end timeout for one `propose_batch` attempt.
    pub propose_timeout: Duration,
    /// A leader that cannot refresh quorum-stake acks within this window
    /// steps down instead of holding write availability.
    pub leader_lease_timeout: Duration,

    /// A follower further behind than this receives a snapshot instead of
    /// incremental log replay.
    pub snapshot_lag_threshold: u64,
    /// Per-proposal bounds: count and byte budget, whichever hits first.
    pub proposal_batch_max_txs: usize,
    pub proposal_batch_max_bytes: usize,
    /// Max entries shipped in one AppendEntries during catch-up.
    pub replication_batch_max: usize,

    pub mempool_capacity: usize,
    pub max_tx_payload_bytes: usize,

    pub analyzer: crate::analyzer::Strategy,
    pub executor_workers: usize,
}

impl Config {
    /// Defaults sized for in-process clusters; production deployments tune
    /// the timeouts up.
    pub fn new(node_id: NodeId, members: Vec<Member>) -> Self {
        Self {
            node_id,
            members,
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            rpc_timeout: Duration::from_millis(200),
            propose_timeout: Duration::from_secs(2),
            leader_lease_timeout: Duration::from_millis(600),
            snapshot_lag_threshold: 256,
            proposal_batch_max_txs: 512,
            proposal_batch_max_bytes: 1 << 20,
            replication_batch_max: 256,
            mempool_capacity: 65_536,
            max_tx_payload_bytes: 64 * 1024,
            analyzer: crate::analyzer::Strategy::UnionFind,
            executor_workers: 4,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.members.is_empty(), "member set cannot be empty");
        anyhow::ensure!(
            self.members.iter().any(|m| m.id == self.node_id),
            "node {} must be in the member set",
            self.node_id
        );
        anyhow::ensure!(
            self.members.iter().all(|m| m.stake > 0),
            "members must carry non-zero stake"
        );
        let mut ids: Vec<NodeId> = self.members.iter().map(|m| m.id).collect();
        ids.sort_unstable();
        ids.dedup();
        anyhow::ensure!(ids.len() == self.members.len(), "duplicate member ids");
        anyhow::ensure!(
            self.election_timeout_min < self.election_timeout_max,
            "election timeout range is empty"
        );
        anyhow::ensure!(self.executor_workers > 0, "executor_workers must be > 0");
        anyhow::ensure!(
            self.proposal_batch_max_txs > 0,
            "proposal_batch_max_txs must be > 0"
        );
        Ok(())
    }

    pub fn total_stake(&self) -> u64 {
        self.members.iter().map(|m| m.stake).sum()
    }

    /// Minimum stake that satisfies quorum: strictly more than two-thirds
    /// of total stake. Stake-weighted, never node-count.
    pub fn quorum_stake(&self) -> u64 {
        (self.total_stake() * 2) / 3 + 1
    }

    pub fn stake_of(&self, id: NodeId) -> u64 {
        self.members
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.stake)
            .unwrap_or(0)
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.members
            .iter()
            .map(|m| m.id)
            .filter(|id| *id != self.node_id)
            .collect()
    }
}

/// In-memory `LogStore` for engine tests and ephemeral deployments.
pub struct MemoryLog {
    entries: Mutex<Vec<LogEntry>>,
    hard_state: Mutex<Option<HardState>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            hard_state: Mutex::new(None),
        }
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStore for MemoryLog {
    fn append(&self, entry: &LogEntry) -> anyhow::Result<u64> {
        let mut entries = self.entries.lock().expect("memory log lock");
        if let Some(last) = entries.last() {
            anyhow::ensure!(
                entry.index > last.index,
                "append out of order: {} after {}",
                entry.index,
                last.index
            );
        }
        entries.push(entry.clone());
        Ok(entries.len() as u64 - 1)
    }

    fn read_range(&self, from: LogIndex, to: LogIndex) -> anyhow::Result<Vec<LogEntry>> {
        let entries = self.entries.lock().expect("memory log lock");
        Ok(entries
            .iter()
            .filter(|e| e.index >= from && e.index <= to)
            .cloned()
            .collect())
    }

    fn last_index(&self) -> anyhow::Result<Option<LogIndex>> {
        Ok(self
            .entries
            .lock()
            .expect("memory log lock")
            .last()
            .map(|e| e.index))
    }

    fn last_term(&self) -> anyhow::Result<Option<Term>> {
        Ok(self
            .entries
            .lock()
            .expect("memory log lock")
            .last()
            .map(|e| e.term))
    }

    fn save_hard_state(&self, hs: &HardState) -> anyhow::Result<()> {
        *self.hard_state.lock().expect("hard state lock") = Some(*hs);
        Ok(())
    }

    fn load_hard_state(&self) -> anyhow::Result<Option<HardState>> {
        Ok(*self.hard_state.lock().expect("hard state lock"))
    }
}

/// In-memory `SnapshotStore` counterpart to `MemoryLog`.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshot: Mutex<Option<SnapshotHandle>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, snapshot: &SnapshotHandle) -> anyhow::Result<()> {
        *self.snapshot.lock().expect("snapshot lock") = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> anyhow::Result<Option<SnapshotHandle>> {
        Ok(self.snapshot.lock().expect("snapshot lock").clone())
    }
}

/// Stake map helper used by vote tallies.
pub(crate) fn stake_map(members: &[Member]) -> HashMap<NodeId, u64> {
    members.iter().map(|m| (m.id, m.stake)).collect()
}
