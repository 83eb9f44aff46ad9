//! HyperRAFT++ module wiring.
//!
//! `coordinator` contains the consensus engine and its background loops,
//! `state` holds the per-node volatile state and log tail, and `types`
//! defines the shared message/request types and trait contracts (transport,
//! log store, state machine, snapshot store).

mod coordinator;
mod state;
mod types;

pub use coordinator::{Coordinator, DebugStats};
pub use state::candidate_outranks;
pub use types::{
    AccessKeys, AppendEntriesRequest, AppendEntriesResponse, Batch, BatchId, BatchResult, Config,
    ConsensusError, HardState, InstallSnapshotRequest, InstallSnapshotResponse, LogEntry, LogIndex,
    LogStore, Member, MemoryLog, MemorySnapshotStore, NodeId, Role, SnapshotHandle, SnapshotStore,
    StateMachine, Term, Transaction, Transport, TxApply, TxOutcome, TxnId, VoteRequest,
    VoteResponse,
};
