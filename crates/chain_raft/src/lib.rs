//! HyperRAFT++ consensus engine and batch execution pipeline.
//!
//! `raft` contains the coordinator (leader election, replication, quorum
//! voting), `analyzer` and `executor` turn a committed batch into applied
//! state, `mempool` holds unconfirmed transactions, and `advisors` defines
//! the optional collaborator contracts (ML hints, anomaly gate, signature
//! verification).

pub mod advisors;
pub mod analyzer;
pub mod executor;
pub mod mempool;
pub mod raft;

/// Abort on a broken consensus-safety invariant.
///
/// These conditions (an undeclared key mutated during execution, divergent
/// committed entries) indicate state corruption; continuing would replicate
/// the corruption, so the process stops here. Tests compile this to a panic
/// so `#[should_panic]` can observe it.
macro_rules! fatal_invariant {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        if cfg!(test) {
            panic!("fatal invariant violation");
        } else {
            std::process::abort();
        }
    }};
}

pub(crate) use fatal_invariant;
