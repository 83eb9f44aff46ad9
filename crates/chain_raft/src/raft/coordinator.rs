//! HyperRAFT++ consensus coordinator.
//!
//! This file contains the leader-election state machine, the replication
//! and quorum-voting path, the batch proposal cycle, and the apply loop
//! that feeds committed batches through the parallel executor. Background
//! work (election timer, heartbeats, proposals, apply) runs as spawned
//! loops on an `Arc<Coordinator>`; the (role, term, voted-for) triple and
//! the log tail live behind a single mutex per node instance and the lock
//! is never held across network awaits.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time;

use super::state::{candidate_outranks, PeerProgress, RaftState};
use super::types::{
    stake_map, AppendEntriesRequest, AppendEntriesResponse, Batch, BatchId, Config,
    ConsensusError, HardState, InstallSnapshotRequest, InstallSnapshotResponse, LogEntry,
    LogIndex, LogStore, NodeId, Role, SnapshotHandle, SnapshotStore, StateMachine, Term,
    Transaction, Transport, TxOutcome, VoteRequest, VoteResponse,
};
use crate::advisors::Advisors;
use crate::analyzer::DependencyAnalyzer;
use crate::executor::ParallelExecutor;
use crate::fatal_invariant;
use crate::mempool::Mempool;

/// Snapshot of coordinator internals for debugging / metrics.
#[derive(Clone, Debug)]
pub struct DebugStats {
    pub role: Role,
    pub term: Term,
    pub leader_hint: Option<NodeId>,
    pub last_log_index: LogIndex,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub mempool_len: usize,
    pub elections_started: u64,
    pub elections_won: u64,
    pub candidate_yields: u64,
    pub heartbeats_sent: u64,
    pub append_rejects: u64,
    pub entries_committed: u64,
    pub batches_applied: u64,
    pub txns_applied: u64,
    pub txns_rejected: u64,
    pub proposal_timeouts: u64,
    pub lease_step_downs: u64,
    pub snapshots_sent: u64,
    pub snapshots_installed: u64,
}

/// Atomically updated counters behind `DebugStats`.
#[derive(Default)]
struct Metrics {
    elections_started: AtomicU64,
    elections_won: AtomicU64,
    candidate_yields: AtomicU64,
    heartbeats_sent: AtomicU64,
    append_rejects: AtomicU64,
    entries_committed: AtomicU64,
    batches_applied: AtomicU64,
    txns_applied: AtomicU64,
    txns_rejected: AtomicU64,
    proposal_timeouts: AtomicU64,
    lease_step_downs: AtomicU64,
    snapshots_sent: AtomicU64,
    snapshots_installed: AtomicU64,
}

/// Election timeout drawn uniformly from the configured range.
fn election_jitter(config: &Config) -> time::Duration {
    let min = config.election_timeout_min.as_millis() as u64;
    let max = config.election_timeout_max.as_millis() as u64;
    time::Duration::from_millis(rand::thread_rng().gen_range(min..max))
}

/// One per-peer replication action prepared under the state lock and sent
/// after it is released.
enum PeerSend {
    Entries(AppendEntriesRequest),
    Snapshot,
}

/// The consensus coordinator: owns transport, log, mempool, and executor
/// machinery for one node.
pub struct Coordinator {
    config: Config,
    transport: Arc<dyn Transport>,
    log_store: Arc<dyn LogStore>,
    snapshot_store: Arc<dyn SnapshotStore>,
    sm: Arc<dyn StateMachine>,
    analyzer: DependencyAnalyzer,
    executor: ParallelExecutor,
    mempool: Arc<Mempool>,
    advisors: Advisors,
    state: Mutex<RaftState>,
    /// Serializes batch apply and snapshot creation: a snapshot must not
    /// observe a half-applied batch.
    apply_lock: Mutex<()>,
    apply_notify: Notify,
    started: AtomicBool,
    shutdown: AtomicBool,
    metrics: Metrics,
}

impl Coordinator {
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        log_store: Arc<dyn LogStore>,
        snapshot_store: Arc<dyn SnapshotStore>,
        sm: Arc<dyn StateMachine>,
        advisors: Advisors,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate()?;

        let mempool = Arc::new(Mempool::new(
            config.mempool_capacity,
            config.max_tx_payload_bytes,
            advisors.verifier.clone(),
        ));
        let analyzer = DependencyAnalyzer::new(config.analyzer);
        let executor = ParallelExecutor::new(config.executor_workers, sm.clone());

        // The first election deadline is jittered like every later one, so
        // a cluster booting in lockstep does not stand simultaneously.
        let mut state = RaftState::new(time::Instant::now() + election_jitter(&config));
        if let Some(hs) = log_store.load_hard_state()? {
            state.term = hs.term;
            state.voted_for = hs.voted_for;
        }

        let node = Arc::new(Self {
            config,
            transport,
            log_store,
            snapshot_store,
            sm,
            analyzer,
            executor,
            mempool,
            advisors,
            state: Mutex::new(state),
            apply_lock: Mutex::new(()),
            apply_notify: Notify::new(),
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            metrics: Metrics::default(),
        });
        Ok(node)
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    pub fn state_machine(&self) -> &Arc<dyn StateMachine> {
        &self.sm
    }

    /// Rebuild state from durable storage. Must run before `start`.
    ///
    /// Restores the latest snapshot (if any), then replays every committed
    /// entry above its floor through the executor, so a restarted node
    /// reaches the exact pre-crash applied state.
    pub async fn recover(&self) -> anyhow::Result<usize> {
        let snapshot = self.snapshot_store.load()?;
        let mut replayed = 0usize;

        let mut state = self.state.lock().await;
        if let Some(snapshot) = &snapshot {
            self.sm.restore(&snapshot.state)?;
            state.reset_to_snapshot(snapshot);
            tracing::info!(
                floor = snapshot.last_included_index,
                "restored state snapshot"
            );
        }

        let floor = state.snapshot_index;
        let last = self.log_store.last_index()?.unwrap_or(0);
        if last > floor {
            let entries = self.log_store.read_range(floor + 1, last)?;
            for entry in entries {
                if entry.index != state.last_index() + 1 {
                    // Entries below an installed snapshot floor can be
                    // stale leftovers; anything else is corruption.
                    if entry.index <= floor {
                        continue;
                    }
                    fatal_invariant!(
                        index = entry.index,
                        expected = state.last_index() + 1,
                        "durable log is not contiguous"
                    );
                }
                let graph = self.analyzer.analyze(&entry.batch);
                let result = self.executor.apply(&entry.batch, &graph);
                self.note_outcomes(&result.outcomes);
                state.push(entry);
                state.commit_index = state.last_index();
                state.last_applied = state.last_index();
                replayed += 1;
            }
        }
        if replayed > 0 {
            tracing::info!(replayed, applied = state.last_applied, "replayed committed log");
        }
        Ok(replayed)
    }

    /// Spawn the background loops (election timer, heartbeats, proposal
    /// cycle, apply). Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let node = self.clone();
        tokio::spawn(async move { node.election_loop().await });

        let node = self.clone();
        tokio::spawn(async move { node.heartbeat_loop().await });

        let node = self.clone();
        tokio::spawn(async move { node.proposal_loop().await });

        let node = self.clone();
        tokio::spawn(async move { node.apply_loop().await });
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.apply_notify.notify_waiters();
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub async fn role(&self) -> Role {
        self.state.lock().await.role
    }

    pub async fn current_term(&self) -> Term {
        self.state.lock().await.term
    }

    pub async fn current_leader(&self) -> Option<NodeId> {
        self.state.lock().await.leader_hint
    }

    pub async fn commit_index(&self) -> LogIndex {
        self.state.lock().await.commit_index
    }

    pub async fn last_applied(&self) -> LogIndex {
        self.state.lock().await.last_applied
    }

    /// Commit status for a batch id: `(index, committed)` when the batch is
    /// in the log. The idempotent check callers use instead of blind
    /// resubmission after a `QuorumTimeout`.
    pub async fn batch_status(&self, id: &BatchId) -> Option<(LogIndex, bool)> {
        let state = self.state.lock().await;
        state
            .batch_index
            .get(id)
            .map(|idx| (*idx, *idx <= state.commit_index))
    }

    pub async fn debug_stats(&self) -> DebugStats {
        let state = self.state.lock().await;
        DebugStats {
            role: state.role,
            term: state.term,
            leader_hint: state.leader_hint,
            last_log_index: state.last_index(),
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            mempool_len: self.mempool.len(),
            elections_started: self.metrics.elections_started.load(Ordering::Relaxed),
            elections_won: self.metrics.elections_won.load(Ordering::Relaxed),
            candidate_yields: self.metrics.candidate_yields.load(Ordering::Relaxed),
            heartbeats_sent: self.metrics.heartbeats_sent.load(Ordering::Relaxed),
            append_rejects: self.metrics.append_rejects.load(Ordering::Relaxed),
            entries_committed: self.metrics.entries_committed.load(Ordering::Relaxed),
            batches_applied: self.metrics.batches_applied.load(Ordering::Relaxed),
            txns_applied: self.metrics.txns_applied.load(Ordering::Relaxed),
            txns_rejected: self.metrics.txns_rejected.load(Ordering::Relaxed),
            proposal_timeouts: self.metrics.proposal_timeouts.load(Ordering::Relaxed),
            lease_step_downs: self.metrics.lease_step_downs.load(Ordering::Relaxed),
            snapshots_sent: self.metrics.snapshots_sent.load(Ordering::Relaxed),
            snapshots_installed: self.metrics.snapshots_installed.load(Ordering::Relaxed),
        }
    }

    fn election_jitter(&self) -> time::Duration {
        election_jitter(&self.config)
    }

    // ── Proposal path ───────────────────────────────────────────────────

    /// Propose a batch for commit. Leader-only.
    ///
    /// Appends a tentative entry, fans out replication, and resolves when
    /// quorum stake has acknowledged the entry. On `QuorumTimeout` the
    /// entry is not retracted: it may still commit asynchronously, and a
    /// retry with the same content-addressed batch resolves to the same
    /// index rather than creating a second entry.
    pub async fn propose_batch(self: &Arc<Self>, batch: Batch) -> Result<LogIndex, ConsensusError> {
        if self.is_shutdown() {
            return Err(ConsensusError::Stopped);
        }

        let (wait_tx, wait_rx) = oneshot::channel();
        let (index, batch_id) = {
            let mut state = self.state.lock().await;
            if state.role != Role::Leader {
                return Err(ConsensusError::NotLeader {
                    leader: state.leader_hint,
                });
            }

            if let Some(&existing) = state.batch_index.get(&batch.id) {
                if existing <= state.commit_index {
                    return Ok(existing);
                }
                // Already in flight: wait on the original entry.
                state
                    .proposal_waiters
                    .entry(existing)
                    .or_default()
                    .push(wait_tx);
                (existing, batch.id)
            } else {
                let index = state.last_index() + 1;
                let entry = LogEntry {
                    term: state.term,
                    index,
                    batch,
                };
                let batch_id = entry.batch.id;
                state.push(entry);
                state
                    .proposal_waiters
                    .entry(index)
                    .or_default()
                    .push(wait_tx);
                // Single-node deployments commit on their own stake.
                self.maybe_advance_commit(&mut state);
                (index, batch_id)
            }
        };

        self.replicate_once().await;

        match time::timeout(self.config.propose_timeout, wait_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConsensusError::Stopped),
            Err(_) => {
                self.metrics
                    .proposal_timeouts
                    .fetch_add(1, Ordering::Relaxed);
                Err(ConsensusError::QuorumTimeout {
                    index,
                    batch: batch_id,
                })
            }
        }
    }

    /// Advance the commit index to the highest current-term entry that
    /// quorum stake has replicated; older entries commit transitively.
    /// Newly committed entries become durable before the index moves.
    fn maybe_advance_commit(&self, state: &mut RaftState) {
        if state.role != Role::Leader {
            return;
        }
        let stakes = stake_map(&self.config.members);
        let my_stake = self.config.stake_of(self.config.node_id);
        let threshold = self.config.quorum_stake();

        let mut new_commit = state.commit_index;
        for idx in (state.commit_index + 1)..=state.last_index() {
            let mut acked = my_stake;
            for (peer, progress) in &state.progress {
                if progress.match_index >= idx {
                    acked += stakes.get(peer).copied().unwrap_or(0);
                }
            }
            if acked >= threshold && state.term_at(idx) == Some(state.term) {
                new_commit = idx;
            }
        }

        if new_commit > state.commit_index {
            self.commit_up_to(state, new_commit);
        }
    }

    /// Durably record and mark committed every entry up to `index`, then
    /// wake the apply loop and resolve proposal waiters.
    fn commit_up_to(&self, state: &mut RaftState, index: LogIndex) {
        let durable_floor = match self.log_store.last_index() {
            Ok(last) => last.unwrap_or(0),
            Err(err) => {
                tracing::error!(error = ?err, "log store unavailable; not advancing commit");
                return;
            }
        };
        for idx in (state.commit_index + 1)..=index {
            if idx <= durable_floor {
                continue;
            }
            let entry = match state.entry(idx) {
                Some(entry) => entry,
                None => {
                    fatal_invariant!(index = idx, "committing an entry missing from the log tail");
                }
            };
            if let Err(err) = self.log_store.append(entry) {
                tracing::error!(error = ?err, index = idx, "durable append failed; commit deferred");
                return;
            }
        }

        let delta = index - state.commit_index;
        state.commit_index = index;
        self.metrics
            .entries_committed
            .fetch_add(delta, Ordering::Relaxed);

        for (idx, waiter) in state.take_committed_waiters(index) {
            let _ = waiter.send(Ok(idx));
        }
        self.apply_notify.notify_one();
    }

    // ── Replication ─────────────────────────────────────────────────────

    /// One replication round: ship each peer its tail (or a snapshot when
    /// it is too far behind), without waiting for any single peer. Acks
    /// update progress and may advance the commit index incrementally.
    async fn replicate_once(self: &Arc<Self>) {
        let mut sends: Vec<(NodeId, PeerSend)> = Vec::new();
        {
            let state = self.state.lock().await;
            if state.role != Role::Leader {
                return;
            }
            for peer in self.config.peers() {
                let progress = match state.progress.get(&peer) {
                    Some(p) => *p,
                    None => continue,
                };
                let needs_snapshot = progress.next_index <= state.snapshot_index
                    || state
                        .last_applied
                        .saturating_sub(progress.match_index)
                        > self.config.snapshot_lag_threshold;
                if needs_snapshot && state.last_applied > 0 {
                    sends.push((peer, PeerSend::Snapshot));
                    continue;
                }

                let prev_index = progress.next_index - 1;
                let prev_term = match state.term_at(prev_index) {
                    Some(term) => term,
                    None => {
                        // Probe has fallen below the floor without an
                        // applied snapshot to ship yet; retry next round.
                        continue;
                    }
                };
                let mut entries = Vec::new();
                let mut idx = progress.next_index;
                while idx <= state.last_index()
                    && entries.len() < self.config.replication_batch_max
                {
                    match state.entry(idx) {
                        Some(entry) => entries.push(entry.clone()),
                        None => break,
                    }
                    idx += 1;
                }
                sends.push((
                    peer,
                    PeerSend::Entries(AppendEntriesRequest {
                        term: state.term,
                        leader: self.config.node_id,
                        prev_log_index: prev_index,
                        prev_log_term: prev_term,
                        entries,
                        leader_commit: state.commit_index,
                    }),
                ));
            }
        }

        if sends.is_empty() {
            return;
        }

        // Build at most one snapshot per round and share it.
        let snapshot = if sends.iter().any(|(_, s)| matches!(s, PeerSend::Snapshot)) {
            match self.build_snapshot().await {
                Ok(snapshot) => Some(Arc::new(snapshot)),
                Err(err) => {
                    tracing::warn!(error = ?err, "snapshot build failed; will retry");
                    None
                }
            }
        } else {
            None
        };

        self.metrics.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
        for (peer, send) in sends {
            let node = self.clone();
            match send {
                PeerSend::Entries(req) => {
                    tokio::spawn(async move {
                        let sent_up_to = req.prev_log_index + req.entries.len() as u64;
                        let result = time::timeout(
                            node.config.rpc_timeout,
                            node.transport.append_entries(peer, req),
                        )
                        .await;
                        match result {
                            Ok(Ok(resp)) => node.handle_append_response(peer, sent_up_to, resp).await,
                            Ok(Err(err)) => {
                                tracing::debug!(peer, error = ?err, "append_entries failed")
                            }
                            Err(_) => tracing::debug!(peer, "append_entries timed out"),
                        }
                    });
                }
                PeerSend::Snapshot => {
                    let Some(snapshot) = snapshot.clone() else {
                        continue;
                    };
                    tokio::spawn(async move {
                        node.send_snapshot(peer, snapshot).await;
                    });
                }
            }
        }
    }

    async fn handle_append_response(
        self: &Arc<Self>,
        peer: NodeId,
        sent_up_to: LogIndex,
        resp: AppendEntriesResponse,
    ) {
        let mut state = self.state.lock().await;
        if resp.term > state.term {
            self.step_down(&mut state, resp.term, None);
            return;
        }
        if state.role != Role::Leader || resp.term < state.term {
            return; // stale response from an earlier tenure
        }
        let Some(progress) = state.progress.get_mut(&peer) else {
            return;
        };
        if resp.success {
            progress.last_ack_at = time::Instant::now();
            if sent_up_to > progress.match_index {
                progress.match_index = sent_up_to;
            }
            progress.next_index = progress.match_index + 1;
            self.maybe_advance_commit(&mut state);
        } else {
            // Log mismatch: walk back toward the follower's hint and let
            // the next round retry.
            let hint = resp.match_index.saturating_add(1);
            progress.next_index = progress.next_index.saturating_sub(1).max(1).min(hint);
        }
    }

    /// Capture a consistent snapshot of the applied state.
    async fn build_snapshot(&self) -> anyhow::Result<SnapshotHandle> {
        let _apply_guard = self.apply_lock.lock().await;
        let (floor, floor_term) = {
            let state = self.state.lock().await;
            let floor = state.last_applied;
            let term = state.term_at(floor).unwrap_or(state.snapshot_term);
            (floor, term)
        };
        let state_bytes = self.sm.snapshot()?;
        Ok(SnapshotHandle {
            last_included_index: floor,
            last_included_term: floor_term,
            state: state_bytes,
        })
    }

    async fn send_snapshot(self: &Arc<Self>, peer: NodeId, snapshot: Arc<SnapshotHandle>) {
        let (term, leader) = {
            let state = self.state.lock().await;
            if state.role != Role::Leader {
                return;
            }
            (state.term, self.config.node_id)
        };
        self.metrics.snapshots_sent.fetch_add(1, Ordering::Relaxed);
        let req = InstallSnapshotRequest {
            term,
            leader,
            snapshot: (*snapshot).clone(),
        };
        let floor = snapshot.last_included_index;
        let result = time::timeout(
            self.config.rpc_timeout,
            self.transport.install_snapshot(peer, req),
        )
        .await;
        match result {
            Ok(Ok(resp)) => {
                let mut state = self.state.lock().await;
                if resp.term > state.term {
                    self.step_down(&mut state, resp.term, None);
                    return;
                }
                if resp.ok {
                    if let Some(progress) = state.progress.get_mut(&peer) {
                        progress.last_ack_at = time::Instant::now();
                        progress.match_index = progress.match_index.max(floor);
                        progress.next_index = progress.match_index + 1;
                    }
                    self.maybe_advance_commit(&mut state);
                }
            }
            Ok(Err(err)) => tracing::debug!(peer, error = ?err, "install_snapshot failed"),
            Err(_) => tracing::debug!(peer, "install_snapshot timed out"),
        }
    }

    // ── Role transitions ────────────────────────────────────────────────

    /// Revert to FOLLOWER, adopting `term` when it is newer. Outstanding
    /// proposal waiters fail with `LeaderChanged`.
    fn step_down(&self, state: &mut RaftState, term: Term, leader: Option<NodeId>) {
        if term > state.term {
            state.term = term;
            state.voted_for = None;
            if let Err(err) = self.persist_hard_state(state) {
                tracing::error!(error = ?err, "hard state persist failed during step-down");
            }
        }
        let was_leader = state.role == Role::Leader;
        state.role = Role::Follower;
        state.leader_hint = leader;
        state.votes.clear();
        state.progress.clear();
        state.election_deadline = time::Instant::now() + self.election_jitter();
        if was_leader {
            tracing::info!(term = state.term, "stepped down to follower");
        }
        for waiter in state.take_all_waiters() {
            let _ = waiter.send(Err(ConsensusError::LeaderChanged { term: state.term }));
        }
    }

    fn persist_hard_state(&self, state: &RaftState) -> anyhow::Result<()> {
        self.log_store.save_hard_state(&HardState {
            term: state.term,
            voted_for: state.voted_for,
        })
    }

    /// Begin one election round: bump the term, vote for ourselves, and
    /// canvass peers. Public so operators and deterministic tests can force
    /// a candidacy instead of waiting out the timer.
    pub async fn trigger_election(self: &Arc<Self>) {
        let (term, last_log_index, last_log_term) = {
            let mut state = self.state.lock().await;
            if state.role == Role::Leader || self.is_shutdown() {
                return;
            }
            state.role = Role::Candidate;
            state.term += 1;
            state.voted_for = Some(self.config.node_id);
            state.leader_hint = None;
            state.votes.clear();
            state.votes.insert(self.config.node_id, true);
            state.election_deadline = time::Instant::now() + self.election_jitter();
            if let Err(err) = self.persist_hard_state(&state) {
                // Without a durable self-vote we must not canvass: a crash
                // could double-vote this term.
                tracing::error!(error = ?err, "hard state persist failed; aborting candidacy");
                state.role = Role::Follower;
                return;
            }
            (state.term, state.last_index(), state.last_term())
        };
        self.metrics
            .elections_started
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!(term, "starting election");

        let mut futs = FuturesUnordered::new();
        for peer in self.config.peers() {
            let transport = self.transport.clone();
            let rpc_timeout = self.config.rpc_timeout;
            let req = VoteRequest {
                term,
                candidate: self.config.node_id,
                candidate_stake: self.config.stake_of(self.config.node_id),
                last_log_index,
                last_log_term,
            };
            futs.push(async move {
                (
                    peer,
                    time::timeout(rpc_timeout, transport.request_vote(peer, req)).await,
                )
            });
        }

        // Quorum is evaluated incrementally as responses arrive; whatever
        // is still outstanding once this round resolves is abandoned.
        let mut granted_stake = self.config.stake_of(self.config.node_id);
        let threshold = self.config.quorum_stake();
        loop {
            if granted_stake >= threshold {
                let mut state = self.state.lock().await;
                if state.role != Role::Candidate || state.term != term {
                    return; // yielded or superseded mid-canvass
                }
                self.become_leader(&mut state);
                drop(state);
                self.replicate_once().await;
                return;
            }
            let Some((peer, result)) = futs.next().await else {
                tracing::debug!(term, granted_stake, "election round ended without quorum");
                return;
            };
            let resp = match result {
                Ok(Ok(resp)) => resp,
                Ok(Err(err)) => {
                    tracing::debug!(peer, error = ?err, "request_vote failed");
                    continue;
                }
                Err(_) => {
                    tracing::debug!(peer, "request_vote timed out");
                    continue;
                }
            };
            let mut state = self.state.lock().await;
            if resp.term > state.term {
                self.step_down(&mut state, resp.term, None);
                return;
            }
            if state.role != Role::Candidate || state.term != term {
                return;
            }
            if resp.granted && state.votes.insert(resp.voter, true).is_none() {
                granted_stake += self.config.stake_of(resp.voter);
            }
        }
    }

    fn become_leader(&self, state: &mut RaftState) {
        state.role = Role::Leader;
        state.leader_hint = Some(self.config.node_id);
        let next = state.last_index() + 1;
        let now = time::Instant::now();
        state.progress.clear();
        for peer in self.config.peers() {
            state.progress.insert(
                peer,
                PeerProgress {
                    next_index: next,
                    match_index: 0,
                    last_ack_at: now,
                },
            );
        }
        self.metrics.elections_won.fetch_add(1, Ordering::Relaxed);
        tracing::info!(term = state.term, "won election");
    }

    // ── RPC handlers (idempotent; duplicates are no-op acks) ────────────

    pub async fn rpc_request_vote(&self, req: VoteRequest) -> VoteResponse {
        let mut state = self.state.lock().await;
        let me = self.config.node_id;

        if req.term < state.term {
            return VoteResponse {
                term: state.term,
                granted: false,
                voter: me,
            };
        }

        let mut dirty = false;
        if req.term > state.term {
            state.term = req.term;
            state.voted_for = None;
            state.role = Role::Follower;
            state.leader_hint = None;
            state.progress.clear();
            dirty = true;
        } else if state.role == Role::Candidate {
            // HyperRAFT++ tie-break: a same-term rival with more stake (or
            // equal stake and a lower id) wins the collision; we abandon
            // this candidacy and back off a full timeout so the favored
            // rival canvasses an uncontested next round.
            let my_stake = self.config.stake_of(me);
            if candidate_outranks(req.candidate_stake, req.candidate, my_stake, me) {
                state.role = Role::Follower;
                state.election_deadline =
                    time::Instant::now() + self.config.election_timeout_max * 2;
                self.metrics.candidate_yields.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    term = state.term,
                    rival = req.candidate,
                    "yielding candidacy to higher-ranked rival"
                );
            }
        }

        let up_to_date = state.candidate_up_to_date(req.last_log_term, req.last_log_index);
        let unspent = state.voted_for.is_none() || state.voted_for == Some(req.candidate);
        let mut granted = up_to_date && unspent;
        if granted && state.voted_for.is_none() {
            state.voted_for = Some(req.candidate);
            state.election_deadline = time::Instant::now() + self.election_jitter();
            dirty = true;
        }

        // The vote must be durable before the response leaves: a crash
        // after granting but before persisting could double-vote.
        if dirty {
            if let Err(err) = self.persist_hard_state(&state) {
                tracing::error!(error = ?err, "hard state persist failed; withholding vote");
                granted = false;
            }
        }

        VoteResponse {
            term: state.term,
            granted,
            voter: me,
        }
    }

    pub async fn rpc_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut state = self.state.lock().await;
        let me = self.config.node_id;

        if req.term < state.term {
            self.metrics.append_rejects.fetch_add(1, Ordering::Relaxed);
            return AppendEntriesResponse {
                term: state.term,
                success: false,
                match_index: 0,
                from: me,
            };
        }

        if req.term > state.term {
            self.step_down(&mut state, req.term, Some(req.leader));
        } else if state.role == Role::Leader {
            // Two leaders at one term breaks election safety; continuing
            // could commit divergent entries.
            fatal_invariant!(
                term = req.term,
                rival = req.leader,
                "second leader observed at the same term"
            );
        } else if state.role == Role::Candidate {
            state.role = Role::Follower;
        }
        state.leader_hint = Some(req.leader);
        state.election_deadline = time::Instant::now() + self.election_jitter();

        // Log continuity: the entry before the new ones must match.
        match state.term_at(req.prev_log_index) {
            None => {
                self.metrics.append_rejects.fetch_add(1, Ordering::Relaxed);
                return AppendEntriesResponse {
                    term: state.term,
                    success: false,
                    match_index: state.last_index().min(req.prev_log_index.saturating_sub(1)),
                    from: me,
                };
            }
            Some(term) if term != req.prev_log_term => {
                if req.prev_log_index <= state.commit_index {
                    fatal_invariant!(
                        index = req.prev_log_index,
                        ours = term,
                        leaders = req.prev_log_term,
                        "committed entry diverges from the leader's log"
                    );
                }
                state.truncate_from(req.prev_log_index);
                self.metrics.append_rejects.fetch_add(1, Ordering::Relaxed);
                return AppendEntriesResponse {
                    term: state.term,
                    success: false,
                    match_index: state.last_index(),
                    from: me,
                };
            }
            Some(_) => {}
        }

        for entry in &req.entries {
            match state.term_at(entry.index) {
                Some(term) if term == entry.term => continue, // duplicate delivery
                Some(_) => {
                    if entry.index <= state.commit_index {
                        fatal_invariant!(
                            index = entry.index,
                            "committed entry diverges from the leader's log"
                        );
                    }
                    state.truncate_from(entry.index);
                    state.push(entry.clone());
                }
                None => {
                    if entry.index == state.last_index() + 1 {
                        state.push(entry.clone());
                    } else if entry.index > state.snapshot_index {
                        fatal_invariant!(
                            index = entry.index,
                            last = state.last_index(),
                            "append would leave a gap in the log"
                        );
                    }
                    // Entries at or below the snapshot floor are stale
                    // duplicates; ignore them.
                }
            }
        }

        let match_index = req.prev_log_index + req.entries.len() as u64;
        let new_commit = req.leader_commit.min(match_index);
        if new_commit > state.commit_index {
            let target = new_commit;
            self.commit_follower(&mut state, target);
        }

        AppendEntriesResponse {
            term: state.term,
            success: true,
            match_index,
            from: me,
        }
    }

    /// Follower-side commit: durably append and advance, mirroring the
    /// leader's `commit_up_to` without waiter bookkeeping.
    fn commit_follower(&self, state: &mut RaftState, index: LogIndex) {
        self.commit_up_to(state, index);
    }

    pub async fn rpc_install_snapshot(
        &self,
        req: InstallSnapshotRequest,
    ) -> InstallSnapshotResponse {
        let mut state = self.state.lock().await;
        if req.term < state.term {
            return InstallSnapshotResponse {
                term: state.term,
                ok: false,
            };
        }
        if req.term > state.term {
            self.step_down(&mut state, req.term, Some(req.leader));
        }
        state.leader_hint = Some(req.leader);
        state.election_deadline = time::Instant::now() + self.election_jitter();

        let floor = req.snapshot.last_included_index;
        if floor <= state.commit_index {
            // Already at or past this snapshot; duplicate delivery.
            return InstallSnapshotResponse {
                term: state.term,
                ok: true,
            };
        }

        if let Err(err) = self.snapshot_store.save(&req.snapshot) {
            tracing::error!(error = ?err, "snapshot persist failed");
            return InstallSnapshotResponse {
                term: state.term,
                ok: false,
            };
        }
        if let Err(err) = self.sm.restore(&req.snapshot.state) {
            tracing::error!(error = ?err, "snapshot restore failed");
            return InstallSnapshotResponse {
                term: state.term,
                ok: false,
            };
        }
        state.reset_to_snapshot(&req.snapshot);
        self.metrics
            .snapshots_installed
            .fetch_add(1, Ordering::Relaxed);
        tracing::info!(floor, "installed snapshot from leader");

        InstallSnapshotResponse {
            term: state.term,
            ok: true,
        }
    }

    // ── Background loops ────────────────────────────────────────────────

    async fn election_loop(self: Arc<Self>) {
        loop {
            if self.is_shutdown() {
                return;
            }
            let deadline = { self.state.lock().await.election_deadline };
            time::sleep_until(deadline).await;
            if self.is_shutdown() {
                return;
            }
            let due = {
                let mut state = self.state.lock().await;
                if state.role == Role::Leader {
                    // Leaders do not run an election timer.
                    state.election_deadline = time::Instant::now() + self.election_jitter();
                    false
                } else {
                    time::Instant::now() >= state.election_deadline
                }
            };
            if due {
                self.trigger_election().await;
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.is_shutdown() {
                return;
            }
            {
                let mut state = self.state.lock().await;
                if state.role != Role::Leader {
                    continue;
                }
                // Leader lease: without fresh quorum-stake acks we may be
                // partitioned; step down instead of holding writes.
                let now = time::Instant::now();
                let mut fresh = self.config.stake_of(self.config.node_id);
                for (peer, progress) in &state.progress {
                    if now.duration_since(progress.last_ack_at) <= self.config.leader_lease_timeout
                    {
                        fresh += self.config.stake_of(*peer);
                    }
                }
                if fresh < self.config.quorum_stake() {
                    self.metrics.lease_step_downs.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(term = state.term, "leader lease lost quorum; stepping down");
                    let term = state.term;
                    self.step_down(&mut state, term, None);
                    continue;
                }
            }
            self.replicate_once().await;
        }
    }

    /// Leader proposal cycle: pull a bounded batch from the mempool,
    /// consult the advisors, and propose. An empty mempool cycle is just a
    /// heartbeat (the heartbeat loop already covers follower liveness).
    async fn proposal_loop(self: Arc<Self>) {
        loop {
            if self.is_shutdown() {
                return;
            }
            if self.role().await != Role::Leader {
                time::sleep(self.config.heartbeat_interval).await;
                continue;
            }

            let mut txns = self.mempool.pull_batch(
                self.config.proposal_batch_max_txs,
                self.config.proposal_batch_max_bytes,
                self.advisors.gate.as_ref(),
            );
            if txns.is_empty() {
                time::sleep(self.config.heartbeat_interval).await;
                continue;
            }

            self.order_batch(&mut txns);
            let term = self.current_term().await;
            let batch = Batch::new(self.config.node_id, term, txns);
            let batch_id = batch.id;
            match self.propose_batch(batch).await {
                Ok(index) => {
                    tracing::debug!(index, batch = ?batch_id, "batch committed");
                }
                Err(ConsensusError::QuorumTimeout { index, .. }) => {
                    // Not retracted: the entry may still commit; the batch
                    // id keeps any retry idempotent.
                    tracing::warn!(index, batch = ?batch_id, "proposal timed out awaiting quorum");
                }
                Err(err) => {
                    tracing::debug!(error = %err, "proposal abandoned");
                    time::sleep(self.config.heartbeat_interval).await;
                }
            }
        }
    }

    /// Apply advisor hints to a pulled transaction set. Best-effort: any
    /// advisor failure leaves the admission order untouched.
    fn order_batch(&self, txns: &mut [Transaction]) {
        match self.advisors.ordering.score(txns) {
            Ok(scores) if scores.len() == txns.len() => {
                let mut order: Vec<usize> = (0..txns.len()).collect();
                order.sort_by_key(|&i| std::cmp::Reverse(scores[i]));
                let reordered: Vec<Transaction> =
                    order.iter().map(|&i| txns[i].clone()).collect();
                txns.clone_from_slice(&reordered);
            }
            Ok(_) => tracing::debug!("ordering advisor returned a mismatched score set; ignored"),
            Err(err) => tracing::debug!(error = ?err, "ordering advisor unavailable; fifo order"),
        }
        match self.advisors.balancer.assign(txns) {
            Ok(hints) => {
                tracing::trace!(hints = hints.len(), "load-balancing hints received");
            }
            Err(err) => {
                tracing::debug!(error = ?err, "load-balancing advisor unavailable; uniform")
            }
        }
    }

    /// Apply committed entries in index order through the executor.
    async fn apply_loop(self: Arc<Self>) {
        loop {
            if self.is_shutdown() {
                return;
            }
            tokio::select! {
                _ = self.apply_notify.notified() => {}
                _ = time::sleep(time::Duration::from_millis(25)) => {}
            }

            loop {
                let _apply_guard = self.apply_lock.lock().await;
                let entry = {
                    let state = self.state.lock().await;
                    if state.last_applied >= state.commit_index {
                        None
                    } else {
                        let idx = state.last_applied + 1;
                        match state.entry(idx) {
                            Some(entry) => Some(entry.clone()),
                            None => {
                                fatal_invariant!(
                                    index = idx,
                                    "committed entry missing from the log tail at apply time"
                                );
                            }
                        }
                    }
                };
                let Some(entry) = entry else { break };

                let graph = self.analyzer.analyze(&entry.batch);
                let result = self.executor.apply(&entry.batch, &graph);
                self.note_outcomes(&result.outcomes);

                let ids: Vec<_> = entry.batch.txns.iter().map(|tx| tx.id).collect();
                self.mempool.evict(&ids);

                let mut state = self.state.lock().await;
                state.last_applied = entry.index;
                self.metrics.batches_applied.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    index = entry.index,
                    txns = entry.batch.txns.len(),
                    "applied committed batch"
                );
            }
        }
    }

    fn note_outcomes(&self, outcomes: &[TxOutcome]) {
        let rejected = outcomes
            .iter()
            .filter(|o| matches!(o, TxOutcome::Rejected { .. }))
            .count() as u64;
        let applied = outcomes.len() as u64 - rejected;
        self.metrics.txns_applied.fetch_add(applied, Ordering::Relaxed);
        self.metrics.txns_rejected.fetch_add(rejected, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::advisors::Advisors;
    use crate::raft::types::{AccessKeys, MemoryLog, MemorySnapshotStore, Member, TxApply};

    /// Minimal state machine: counts applied transactions per write key.
    struct TallyMachine {
        applied: StdMutex<HashMap<Vec<u8>, u64>>,
    }

    impl TallyMachine {
        fn new() -> Self {
            Self {
                applied: StdMutex::new(HashMap::new()),
            }
        }
    }

    impl StateMachine for TallyMachine {
        fn apply(&self, tx: &Transaction) -> TxApply {
            let mut applied = self.applied.lock().unwrap();
            for key in &tx.access.writes {
                *applied.entry(key.clone()).or_insert(0) += 1;
            }
            TxApply {
                outcome: TxOutcome::Applied,
                touched: tx.access.clone(),
            }
        }

        fn snapshot(&self) -> anyhow::Result<Vec<u8>> {
            let applied = self.applied.lock().unwrap();
            let mut items: Vec<(Vec<u8>, u64)> =
                applied.iter().map(|(k, v)| (k.clone(), *v)).collect();
            items.sort();
            Ok(serde_json::to_vec(&items)?)
        }

        fn restore(&self, state: &[u8]) -> anyhow::Result<()> {
            let items: Vec<(Vec<u8>, u64)> = serde_json::from_slice(state)?;
            *self.applied.lock().unwrap() = items.into_iter().collect();
            Ok(())
        }

        fn digest(&self) -> [u8; 32] {
            let applied = self.applied.lock().unwrap();
            let mut items: Vec<(&Vec<u8>, &u64)> = applied.iter().collect();
            items.sort();
            let mut hasher = blake3::Hasher::new();
            for (k, v) in items {
                hasher.update(k);
                hasher.update(&v.to_le_bytes());
            }
            *hasher.finalize().as_bytes()
        }
    }

    /// Transport for single-node tests: there are no peers to reach.
    struct NoPeers;

    #[async_trait::async_trait]
    impl Transport for NoPeers {
        async fn request_vote(
            &self,
            _target: NodeId,
            _req: VoteRequest,
        ) -> anyhow::Result<VoteResponse> {
            anyhow::bail!("no peers")
        }

        async fn append_entries(
            &self,
            _target: NodeId,
            _req: AppendEntriesRequest,
        ) -> anyhow::Result<AppendEntriesResponse> {
            anyhow::bail!("no peers")
        }

        async fn install_snapshot(
            &self,
            _target: NodeId,
            _req: InstallSnapshotRequest,
        ) -> anyhow::Result<InstallSnapshotResponse> {
            anyhow::bail!("no peers")
        }
    }

    fn tx(key: &[u8], n: u8) -> Transaction {
        Transaction::new(
            AccessKeys {
                reads: vec![],
                writes: vec![key.to_vec()],
            },
            vec![n],
            vec![],
        )
    }

    fn single_node() -> Arc<Coordinator> {
        let config = Config::new(1, vec![Member { id: 1, stake: 100 }]);
        Coordinator::new(
            config,
            Arc::new(NoPeers),
            Arc::new(MemoryLog::new()),
            Arc::new(MemorySnapshotStore::new()),
            Arc::new(TallyMachine::new()),
            Advisors::default(),
        )
        .unwrap()
    }

    fn three_node_config(me: NodeId) -> Config {
        Config::new(
            me,
            vec![
                Member { id: 1, stake: 1000 },
                Member { id: 2, stake: 2000 },
                Member { id: 3, stake: 500 },
            ],
        )
    }

    fn follower(me: NodeId) -> Arc<Coordinator> {
        Coordinator::new(
            three_node_config(me),
            Arc::new(NoPeers),
            Arc::new(MemoryLog::new()),
            Arc::new(MemorySnapshotStore::new()),
            Arc::new(TallyMachine::new()),
            Advisors::default(),
        )
        .unwrap()
    }

    fn vote_req(term: Term, candidate: NodeId, stake: u64) -> VoteRequest {
        VoteRequest {
            term,
            candidate,
            candidate_stake: stake,
            last_log_index: 0,
            last_log_term: 0,
        }
    }

    fn entry_at(term: Term, index: LogIndex, key: &[u8]) -> LogEntry {
        LogEntry {
            term,
            index,
            batch: Batch::new(2, term, vec![tx(key, index as u8)]),
        }
    }

    #[tokio::test]
    async fn single_node_elects_itself_and_commits() {
        let node = single_node();
        node.trigger_election().await;
        assert_eq!(node.role().await, Role::Leader);

        let batch = Batch::new(1, node.current_term().await, vec![tx(b"a", 1)]);
        let index = node.propose_batch(batch).await.unwrap();
        assert_eq!(index, 1);
        assert_eq!(node.commit_index().await, 1);
    }

    #[tokio::test]
    async fn propose_on_follower_returns_not_leader() {
        let node = single_node();
        let batch = Batch::new(1, 0, vec![tx(b"a", 1)]);
        assert!(matches!(
            node.propose_batch(batch).await,
            Err(ConsensusError::NotLeader { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_batch_resolves_to_same_index() {
        let node = single_node();
        node.trigger_election().await;

        let batch = Batch::new(1, node.current_term().await, vec![tx(b"a", 1)]);
        let first = node.propose_batch(batch.clone()).await.unwrap();
        let second = node.propose_batch(batch.clone()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(node.commit_index().await, first);
        assert_eq!(node.batch_status(&batch.id).await, Some((first, true)));
    }

    #[tokio::test]
    async fn vote_is_persisted_before_response() {
        let log: Arc<MemoryLog> = Arc::new(MemoryLog::new());
        let node = Coordinator::new(
            three_node_config(1),
            Arc::new(NoPeers),
            log.clone(),
            Arc::new(MemorySnapshotStore::new()),
            Arc::new(TallyMachine::new()),
            Advisors::default(),
        )
        .unwrap();

        let resp = node.rpc_request_vote(vote_req(1, 2, 2000)).await;
        assert!(resp.granted);

        let hs = log.load_hard_state().unwrap().unwrap();
        assert_eq!(hs.term, 1);
        assert_eq!(hs.voted_for, Some(2));
    }

    #[tokio::test]
    async fn at_most_one_vote_per_term() {
        let node = follower(1);
        assert!(node.rpc_request_vote(vote_req(1, 2, 2000)).await.granted);
        // A different candidate at the same term is refused.
        assert!(!node.rpc_request_vote(vote_req(1, 3, 500)).await.granted);
        // The same candidate retrying is re-acked (idempotent).
        assert!(node.rpc_request_vote(vote_req(1, 2, 2000)).await.granted);
        // A newer term resets the vote.
        assert!(node.rpc_request_vote(vote_req(2, 3, 500)).await.granted);
    }

    #[tokio::test]
    async fn stale_term_vote_is_rejected() {
        let node = follower(1);
        assert!(node.rpc_request_vote(vote_req(5, 2, 2000)).await.granted);
        let resp = node.rpc_request_vote(vote_req(3, 3, 500)).await;
        assert!(!resp.granted);
        assert_eq!(resp.term, 5);
    }

    #[tokio::test]
    async fn vote_requires_up_to_date_log() {
        let node = follower(1);
        // Give the follower a log entry at term 1.
        let resp = node
            .rpc_append_entries(AppendEntriesRequest {
                term: 1,
                leader: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![entry_at(1, 1, b"k")],
                leader_commit: 0,
            })
            .await;
        assert!(resp.success);

        // Candidate with an empty log is behind.
        let mut req = vote_req(2, 3, 500);
        req.last_log_index = 0;
        req.last_log_term = 0;
        assert!(!node.rpc_request_vote(req).await.granted);

        // Candidate with the same log is granted.
        let mut req = vote_req(2, 3, 500);
        req.last_log_index = 1;
        req.last_log_term = 1;
        assert!(node.rpc_request_vote(req).await.granted);
    }

    #[tokio::test]
    async fn candidate_yields_to_higher_stake_rival() {
        let node = follower(1); // stake 1000
        node.trigger_election().await; // becomes candidate at term 1 (canvass fails, NoPeers)
        assert_eq!(node.role().await, Role::Candidate);

        // Rival with stake 2000 at the same term: yield.
        let term = node.current_term().await;
        let resp = node.rpc_request_vote(vote_req(term, 2, 2000)).await;
        assert_eq!(node.role().await, Role::Follower);
        // The self-vote was already spent this term.
        assert!(!resp.granted);
        assert_eq!(node.debug_stats().await.candidate_yields, 1);
    }

    #[tokio::test]
    async fn candidate_does_not_yield_to_lower_stake_rival() {
        let node = follower(2); // stake 2000
        node.trigger_election().await;
        assert_eq!(node.role().await, Role::Candidate);

        let term = node.current_term().await;
        let resp = node.rpc_request_vote(vote_req(term, 3, 500)).await;
        assert_eq!(node.role().await, Role::Candidate);
        assert!(!resp.granted);
    }

    #[tokio::test]
    async fn append_entries_rejects_stale_term() {
        let node = follower(1);
        node.rpc_request_vote(vote_req(5, 2, 2000)).await;
        let resp = node
            .rpc_append_entries(AppendEntriesRequest {
                term: 3,
                leader: 3,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            })
            .await;
        assert!(!resp.success);
        assert_eq!(resp.term, 5);
    }

    #[tokio::test]
    async fn append_entries_requires_continuity() {
        let node = follower(1);
        // prev at index 3 without any log: reject with a walk-back hint.
        let resp = node
            .rpc_append_entries(AppendEntriesRequest {
                term: 1,
                leader: 2,
                prev_log_index: 3,
                prev_log_term: 1,
                entries: vec![entry_at(1, 4, b"k")],
                leader_commit: 0,
            })
            .await;
        assert!(!resp.success);
        assert!(resp.match_index <= 2);
    }

    #[tokio::test]
    async fn append_entries_truncates_uncommitted_conflict() {
        let node = follower(1);
        // Two tentative entries at term 1.
        let resp = node
            .rpc_append_entries(AppendEntriesRequest {
                term: 1,
                leader: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![entry_at(1, 1, b"a"), entry_at(1, 2, b"b")],
                leader_commit: 0,
            })
            .await;
        assert!(resp.success);

        // A new leader at term 2 overwrites index 2.
        let replacement = entry_at(2, 2, b"c");
        let replacement_id = replacement.batch.id;
        let resp = node
            .rpc_append_entries(AppendEntriesRequest {
                term: 2,
                leader: 3,
                prev_log_index: 1,
                prev_log_term: 1,
                entries: vec![replacement],
                leader_commit: 2,
            })
            .await;
        assert!(resp.success);
        assert_eq!(node.commit_index().await, 2);
        assert_eq!(node.batch_status(&replacement_id).await, Some((2, true)));
    }

    #[tokio::test]
    async fn duplicate_append_is_a_noop_ack() {
        let node = follower(1);
        let req = AppendEntriesRequest {
            term: 1,
            leader: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry_at(1, 1, b"a")],
            leader_commit: 1,
        };
        let first = node.rpc_append_entries(req.clone()).await;
        let second = node.rpc_append_entries(req).await;
        assert!(first.success && second.success);
        assert_eq!(first.match_index, second.match_index);
        assert_eq!(node.commit_index().await, 1);
    }

    #[tokio::test]
    async fn commit_monotonicity_on_follower() {
        let node = follower(1);
        let resp = node
            .rpc_append_entries(AppendEntriesRequest {
                term: 1,
                leader: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![entry_at(1, 1, b"a"), entry_at(1, 2, b"b")],
                leader_commit: 2,
            })
            .await;
        assert!(resp.success);
        assert_eq!(node.commit_index().await, 2);

        // A heartbeat with an older leader_commit must not regress it.
        let resp = node
            .rpc_append_entries(AppendEntriesRequest {
                term: 1,
                leader: 2,
                prev_log_index: 2,
                prev_log_term: 1,
                entries: vec![],
                leader_commit: 1,
            })
            .await;
        assert!(resp.success);
        assert_eq!(node.commit_index().await, 2);
    }

    #[tokio::test]
    async fn snapshot_install_fast_forwards_follower() {
        let machine = Arc::new(TallyMachine::new());
        machine.apply(&tx(b"seed", 1));
        let snapshot_state = machine.snapshot().unwrap();

        let node = follower(1);
        let resp = node
            .rpc_install_snapshot(InstallSnapshotRequest {
                term: 4,
                leader: 2,
                snapshot: SnapshotHandle {
                    last_included_index: 40,
                    last_included_term: 3,
                    state: snapshot_state,
                },
            })
            .await;
        assert!(resp.ok);
        assert_eq!(node.commit_index().await, 40);
        assert_eq!(node.last_applied().await, 40);
        assert_eq!(node.current_term().await, 4);
        assert_eq!(node.debug_stats().await.snapshots_installed, 1);

        // A duplicate of the same snapshot is acked without re-installing.
        let resp = node
            .rpc_install_snapshot(InstallSnapshotRequest {
                term: 4,
                leader: 2,
                snapshot: SnapshotHandle {
                    last_included_index: 40,
                    last_included_term: 3,
                    state: vec![],
                },
            })
            .await;
        assert!(resp.ok);
        assert_eq!(node.debug_stats().await.snapshots_installed, 1);
    }

    #[tokio::test]
    async fn recover_replays_committed_entries() {
        let log: Arc<MemoryLog> = Arc::new(MemoryLog::new());
        let snaps = Arc::new(MemorySnapshotStore::new());

        // First run: commit two entries.
        {
            let machine = Arc::new(TallyMachine::new());
            let node = Coordinator::new(
                Config::new(1, vec![Member { id: 1, stake: 100 }]),
                Arc::new(NoPeers),
                log.clone(),
                snaps.clone(),
                machine,
                Advisors::default(),
            )
            .unwrap();
            node.trigger_election().await;
            let term = node.current_term().await;
            node.propose_batch(Batch::new(1, term, vec![tx(b"a", 1)]))
                .await
                .unwrap();
            node.propose_batch(Batch::new(1, term, vec![tx(b"b", 2)]))
                .await
                .unwrap();
        }

        // Second run: a fresh coordinator over the same durable log.
        let machine = Arc::new(TallyMachine::new());
        let node = Coordinator::new(
            Config::new(1, vec![Member { id: 1, stake: 100 }]),
            Arc::new(NoPeers),
            log,
            snaps,
            machine.clone(),
            Advisors::default(),
        )
        .unwrap();
        let replayed = node.recover().await.unwrap();
        assert_eq!(replayed, 2);
        assert_eq!(node.last_applied().await, 2);
        assert_eq!(machine.applied.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn apply_loop_drains_committed_batches() {
        let node = single_node();
        node.start();
        node.trigger_election().await;
        let term = node.current_term().await;
        node.propose_batch(Batch::new(1, term, vec![tx(b"a", 1)]))
            .await
            .unwrap();

        // Let the apply loop run.
        for _ in 0..10 {
            time::advance(time::Duration::from_millis(30)).await;
            if node.last_applied().await == 1 {
                break;
            }
        }
        assert_eq!(node.last_applied().await, 1);
        assert_eq!(node.debug_stats().await.batches_applied, 1);
        node.shutdown();
    }
}
