//! Per-node volatile consensus state.
//!
//! This module holds the role/term triple, the in-memory log tail, and the
//! leader's replication bookkeeping. It is intentionally separate from the
//! coordinator logic so that state transitions remain testable and easy to
//! reason about. The coordinator serializes access through one mutex per
//! node instance; nothing here is shared process-wide.

use std::cmp::Reverse;
use std::collections::HashMap;

use tokio::sync::oneshot;
use tokio::time;

use super::types::{
    BatchId, ConsensusError, LogEntry, LogIndex, NodeId, Role, SnapshotHandle, Term,
};

/// Leader-side view of one follower's replication progress.
#[derive(Clone, Copy, Debug)]
pub(super) struct PeerProgress {
    /// Next log index to ship to this peer.
    pub(super) next_index: LogIndex,
    /// Highest index known replicated on this peer.
    pub(super) match_index: LogIndex,
    /// Last successful ack, for the leader lease check.
    pub(super) last_ack_at: time::Instant,
}

/// Mutable node state (protected by a mutex in the coordinator).
///
/// The log tail keeps every entry above the snapshot floor, committed and
/// tentative alike; the durable `LogStore` receives entries only once they
/// commit, so `commit_index`/`last_applied` are positional markers rather
/// than per-entry flags.
#[derive(Debug)]
pub(super) struct RaftState {
    pub(super) role: Role,
    pub(super) term: Term,
    pub(super) voted_for: Option<NodeId>,
    pub(super) leader_hint: Option<NodeId>,

    /// Contiguous tail; `entries[i].index == snapshot_index + 1 + i`.
    pub(super) entries: Vec<LogEntry>,
    /// Log floor covered by the latest snapshot (0 when none).
    pub(super) snapshot_index: LogIndex,
    pub(super) snapshot_term: Term,

    pub(super) commit_index: LogIndex,
    pub(super) last_applied: LogIndex,

    pub(super) election_deadline: time::Instant,
    /// Votes received while CANDIDATE, by voter.
    pub(super) votes: HashMap<NodeId, bool>,
    /// Replication progress per peer while LEADER.
    pub(super) progress: HashMap<NodeId, PeerProgress>,

    /// Proposal completions waiting on a commit, by index.
    pub(super) proposal_waiters:
        HashMap<LogIndex, Vec<oneshot::Sender<Result<LogIndex, ConsensusError>>>>,
    /// Content-addressed batch index for idempotent re-proposal.
    pub(super) batch_index: HashMap<BatchId, LogIndex>,
}

impl RaftState {
    pub(super) fn new(initial_deadline: time::Instant) -> Self {
        Self {
            role: Role::Follower,
            term: 0,
            voted_for: None,
            leader_hint: None,
            entries: Vec::new(),
            snapshot_index: 0,
            snapshot_term: 0,
            commit_index: 0,
            last_applied: 0,
            election_deadline: initial_deadline,
            votes: HashMap::new(),
            progress: HashMap::new(),
            proposal_waiters: HashMap::new(),
            batch_index: HashMap::new(),
        }
    }

    pub(super) fn last_index(&self) -> LogIndex {
        self.snapshot_index + self.entries.len() as LogIndex
    }

    pub(super) fn last_term(&self) -> Term {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    /// Term at `index`, if this node still has it. Index 0 is the empty-log
    /// sentinel and always matches term 0.
    pub(super) fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.entry(index).map(|e| e.term)
    }

    pub(super) fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.entries.get((index - self.snapshot_index - 1) as usize)
    }

    /// Append one entry to the tail. Contiguity is the caller's invariant.
    pub(super) fn push(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.batch_index.insert(entry.batch.id, entry.index);
        self.entries.push(entry);
    }

    /// Drop the tail from `index` (inclusive). Only uncommitted entries may
    /// be truncated; callers check against `commit_index` first.
    pub(super) fn truncate_from(&mut self, index: LogIndex) {
        let keep = index.saturating_sub(self.snapshot_index + 1) as usize;
        for removed in self.entries.drain(keep..) {
            self.batch_index.remove(&removed.batch.id);
        }
    }

    /// Candidate log freshness check from the RAFT voting rule: compare
    /// last terms, then last indices.
    pub(super) fn candidate_up_to_date(
        &self,
        candidate_last_term: Term,
        candidate_last_index: LogIndex,
    ) -> bool {
        (candidate_last_term, candidate_last_index) >= (self.last_term(), self.last_index())
    }

    /// Replace the log with a snapshot floor (follower fast catch-up).
    pub(super) fn reset_to_snapshot(&mut self, snapshot: &SnapshotHandle) {
        self.entries.clear();
        self.batch_index.clear();
        self.snapshot_index = snapshot.last_included_index;
        self.snapshot_term = snapshot.last_included_term;
        self.commit_index = snapshot.last_included_index;
        self.last_applied = snapshot.last_included_index;
    }

    /// Take the waiters satisfied by a commit up to `index`.
    pub(super) fn take_committed_waiters(
        &mut self,
        index: LogIndex,
    ) -> Vec<(LogIndex, oneshot::Sender<Result<LogIndex, ConsensusError>>)> {
        let ready: Vec<LogIndex> = self
            .proposal_waiters
            .keys()
            .copied()
            .filter(|idx| *idx <= index)
            .collect();
        let mut out = Vec::new();
        for idx in ready {
            if let Some(waiters) = self.proposal_waiters.remove(&idx) {
                for tx in waiters {
                    out.push((idx, tx));
                }
            }
        }
        out
    }

    /// Fail every outstanding proposal waiter (leadership lost).
    pub(super) fn take_all_waiters(
        &mut self,
    ) -> Vec<oneshot::Sender<Result<LogIndex, ConsensusError>>> {
        self.proposal_waiters
            .drain()
            .flat_map(|(_, waiters)| waiters)
            .collect()
    }
}

/// HyperRAFT++ tie-break between simultaneous candidacies: higher stake
/// wins, equal stakes resolve to the lower node id.
pub fn candidate_outranks(a_stake: u64, a_id: NodeId, b_stake: u64, b_id: NodeId) -> bool {
    (a_stake, Reverse(a_id)) > (b_stake, Reverse(b_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::types::{AccessKeys, Batch, Transaction};

    fn entry(term: Term, index: LogIndex) -> LogEntry {
        let tx = Transaction::new(
            AccessKeys {
                reads: vec![],
                writes: vec![index.to_le_bytes().to_vec()],
            },
            index.to_le_bytes().to_vec(),
            vec![],
        );
        LogEntry {
            term,
            index,
            batch: Batch::new(1, term, vec![tx]),
        }
    }

    fn state_with(entries: &[(Term, LogIndex)]) -> RaftState {
        let mut st = RaftState::new(time::Instant::now());
        for (term, index) in entries {
            st.push(entry(*term, *index));
        }
        st
    }

    #[test]
    fn tie_break_prefers_stake_then_lower_id() {
        assert!(candidate_outranks(2000, 2, 1000, 1));
        assert!(!candidate_outranks(500, 3, 1000, 1));
        // Equal stake: lower id outranks.
        assert!(candidate_outranks(1000, 1, 1000, 2));
        assert!(!candidate_outranks(1000, 2, 1000, 1));
        // Nothing outranks itself.
        assert!(!candidate_outranks(1000, 1, 1000, 1));
    }

    #[test]
    fn up_to_date_compares_term_before_index() {
        let st = state_with(&[(1, 1), (1, 2), (2, 3)]);
        // Higher last term beats a longer log.
        assert!(st.candidate_up_to_date(3, 1));
        // Same last term requires at least the same length.
        assert!(st.candidate_up_to_date(2, 3));
        assert!(!st.candidate_up_to_date(2, 2));
        assert!(!st.candidate_up_to_date(1, 9));
    }

    #[test]
    fn truncate_drops_batch_ids() {
        let mut st = state_with(&[(1, 1), (1, 2), (1, 3)]);
        let dropped = st.entry(3).unwrap().batch.id;
        let kept = st.entry(1).unwrap().batch.id;
        st.truncate_from(2);
        assert_eq!(st.last_index(), 1);
        assert!(!st.batch_index.contains_key(&dropped));
        assert_eq!(st.batch_index.get(&kept), Some(&1));
    }

    #[test]
    fn snapshot_reset_moves_floor() {
        let mut st = state_with(&[(1, 1), (1, 2)]);
        st.reset_to_snapshot(&SnapshotHandle {
            last_included_index: 7,
            last_included_term: 3,
            state: Vec::new(),
        });
        assert_eq!(st.last_index(), 7);
        assert_eq!(st.last_term(), 3);
        assert_eq!(st.term_at(7), Some(3));
        assert_eq!(st.term_at(6), None);
        assert_eq!(st.commit_index, 7);
    }

    #[test]
    fn term_at_sentinel_and_range() {
        let st = state_with(&[(1, 1), (2, 2)]);
        assert_eq!(st.term_at(0), Some(0));
        assert_eq!(st.term_at(1), Some(1));
        assert_eq!(st.term_at(2), Some(2));
        assert_eq!(st.term_at(3), None);
    }
}
