//! Optional collaborator contracts consumed by the consensus pipeline.
//!
//! The advisors are pure, best-effort hint providers: the coordinator may
//! use them to shape batch composition and ordering, but correctness never
//! depends on their output. Every trait ships a neutral default so the
//! engine runs unchanged when no external model or gate is deployed, and an
//! advisor error degrades to the neutral behavior instead of blocking
//! consensus.

use std::sync::Arc;

use crate::raft::{NodeId, Transaction};

/// Shard/validator placement hint for one transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShardHint {
    pub shard: u32,
    pub validator: NodeId,
}

/// ML inference contract: given a transaction set, suggest shard/validator
/// assignments. Consumed as a hint only.
pub trait LoadBalancingAdvisor: Send + Sync + 'static {
    fn assign(&self, txns: &[Transaction]) -> anyhow::Result<Vec<ShardHint>>;
}

/// ML inference contract: priority score per transaction within a batch.
/// Higher scores order earlier. Scores are integers so ordering stays
/// deterministic across nodes and runs.
pub trait OrderingAdvisor: Send + Sync + 'static {
    fn score(&self, txns: &[Transaction]) -> anyhow::Result<Vec<u64>>;
}

/// Verdict from the anomaly gate for one candidate transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    /// Excluded from the next batch pull but kept in the mempool for later
    /// re-evaluation; the submitter is not errored.
    Flag { reason: String },
}

pub trait AnomalyGate: Send + Sync + 'static {
    fn check(&self, tx: &Transaction) -> GateDecision;
}

/// Signature scheme contract, consumed synchronously at mempool admission.
pub trait SignatureVerifier: Send + Sync + 'static {
    fn verify(&self, tx: &Transaction) -> bool;
}

/// Uniform placement: everything on shard 0 with no validator preference.
pub struct UniformAdvisor;

impl LoadBalancingAdvisor for UniformAdvisor {
    fn assign(&self, txns: &[Transaction]) -> anyhow::Result<Vec<ShardHint>> {
        Ok(txns
            .iter()
            .map(|_| ShardHint {
                shard: 0,
                validator: 0,
            })
            .collect())
    }
}

/// Neutral ordering: equal scores, which keeps admission order.
pub struct FifoOrdering;

impl OrderingAdvisor for FifoOrdering {
    fn score(&self, txns: &[Transaction]) -> anyhow::Result<Vec<u64>> {
        Ok(vec![0; txns.len()])
    }
}

/// Gate that admits everything.
pub struct AllowAllGate;

impl AnomalyGate for AllowAllGate {
    fn check(&self, _tx: &Transaction) -> GateDecision {
        GateDecision::Allow
    }
}

/// Verifier that accepts any signature (development/testing only).
pub struct AcceptAllVerifier;

impl SignatureVerifier for AcceptAllVerifier {
    fn verify(&self, _tx: &Transaction) -> bool {
        true
    }
}

/// Keyed-BLAKE3 MAC over the transaction id.
///
/// Stands in for the real signature scheme behind the same contract; the
/// devnet and tests sign with it so admission actually exercises the
/// verification path.
pub struct MacVerifier {
    key: [u8; 32],
}

impl MacVerifier {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn signature_for(&self, tx: &Transaction) -> Vec<u8> {
        blake3::keyed_hash(&self.key, &tx.id.0).as_bytes().to_vec()
    }

    pub fn sign(&self, tx: &mut Transaction) {
        tx.signature = self.signature_for(tx);
    }
}

impl SignatureVerifier for MacVerifier {
    fn verify(&self, tx: &Transaction) -> bool {
        tx.signature.as_slice() == blake3::keyed_hash(&self.key, &tx.id.0).as_bytes()
    }
}

/// Bundle of collaborator implementations handed to the coordinator.
#[derive(Clone)]
pub struct Advisors {
    pub balancer: Arc<dyn LoadBalancingAdvisor>,
    pub ordering: Arc<dyn OrderingAdvisor>,
    pub gate: Arc<dyn AnomalyGate>,
    pub verifier: Arc<dyn SignatureVerifier>,
}

impl Default for Advisors {
    fn default() -> Self {
        Self {
            balancer: Arc::new(UniformAdvisor),
            ordering: Arc::new(FifoOrdering),
            gate: Arc::new(AllowAllGate),
            verifier: Arc::new(AcceptAllVerifier),
        }
    }
}
