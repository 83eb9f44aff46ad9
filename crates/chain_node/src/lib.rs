//! HyperChain node runtime.
//!
//! Wires the consensus engine from `chain_raft` to concrete runtime pieces:
//! the account ledger state machine (`ledger`), the durable file-backed log
//! store (`log`), the in-process transport router (`transport`), and the
//! multi-node cluster harness (`cluster`) used by the devnet binary, the
//! workload generator, and the integration tests.

pub mod cluster;
pub mod ledger;
pub mod log;
pub mod transport;

pub use cluster::{parse_members, Cluster, ClusterBuilder, ClusterNode};
pub use ledger::{account_key, Account, Ledger, TxCommand};
pub use log::{FileLog, FileSnapshotStore, WalStatsSnapshot};
pub use transport::{Router, RouterTransport};
