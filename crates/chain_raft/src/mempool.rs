//! Bounded holding area for unconfirmed transactions.
//!
//! Admission validates structure and signature; duplicates are rejected by
//! id. At capacity the oldest entry is evicted to admit the new submission
//! rather than rejecting it: client-visible loss under sustained overload
//! is the documented trade against unbounded memory growth. Many client
//! threads submit concurrently; a single proposal cycle pulls.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::advisors::{AnomalyGate, GateDecision, SignatureVerifier};
use crate::raft::{Transaction, TxnId};

#[derive(Debug, thiserror::Error)]
pub enum MempoolError {
    #[error("duplicate transaction {0:?}")]
    Duplicate(TxnId),
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("malformed transaction: {0}")]
    Malformed(&'static str),
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

struct Entry {
    tx: Transaction,
    size: usize,
}

struct Inner {
    /// Live entries by id. Queue slots whose id is absent here are ghosts
    /// left behind by eviction and are skipped lazily.
    by_id: HashMap<TxnId, u64>,
    /// Admission order: (seq, entry).
    queue: VecDeque<(u64, Entry)>,
    next_seq: u64,
    bytes: usize,
}

pub struct Mempool {
    inner: Mutex<Inner>,
    verifier: Arc<dyn SignatureVerifier>,
    capacity: usize,
    max_payload_bytes: usize,
    evicted_total: AtomicU64,
    flagged_total: AtomicU64,
}

impl Mempool {
    pub fn new(
        capacity: usize,
        max_payload_bytes: usize,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_id: HashMap::new(),
                queue: VecDeque::new(),
                next_seq: 0,
                bytes: 0,
            }),
            verifier,
            capacity: capacity.max(1),
            max_payload_bytes,
            evicted_total: AtomicU64::new(0),
            flagged_total: AtomicU64::new(0),
        }
    }

    /// Admit one transaction.
    ///
    /// Succeeds even at capacity: the oldest live entry is dropped to make
    /// room. Structural and signature failures reject at the door so an
    /// invalid transaction never reaches a batch.
    pub fn submit(&self, tx: Transaction) -> Result<(), MempoolError> {
        if tx.access.is_empty() {
            return Err(MempoolError::Malformed("empty access declaration"));
        }
        if tx.payload.len() > self.max_payload_bytes {
            return Err(MempoolError::PayloadTooLarge {
                size: tx.payload.len(),
                max: self.max_payload_bytes,
            });
        }
        if Transaction::content_id(&tx.access, &tx.payload) != tx.id {
            return Err(MempoolError::Malformed("id does not match content"));
        }
        if !self.verifier.verify(&tx) {
            return Err(MempoolError::InvalidSignature);
        }

        let mut inner = self.inner.lock().expect("mempool lock");
        if inner.by_id.contains_key(&tx.id) {
            return Err(MempoolError::Duplicate(tx.id));
        }

        while inner.by_id.len() >= self.capacity {
            if !evict_oldest(&mut inner) {
                break;
            }
            self.evicted_total.fetch_add(1, Ordering::Relaxed);
        }

        let size = tx.encoded_len();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.by_id.insert(tx.id, seq);
        inner.bytes += size;
        inner.queue.push_back((seq, Entry { tx, size }));
        Ok(())
    }

    /// Pull up to (`max_count`, `max_bytes`) transactions in admission
    /// order, whichever bound hits first.
    ///
    /// Transactions the anomaly gate flags are skipped but retained for
    /// later re-evaluation; the submitter never sees an error for a flag.
    /// Pulled transactions also stay in the pool until `evict` confirms
    /// their batch applied, so a failed proposal can re-pull them.
    pub fn pull_batch(
        &self,
        max_count: usize,
        max_bytes: usize,
        gate: &dyn AnomalyGate,
    ) -> Vec<Transaction> {
        let inner = self.inner.lock().expect("mempool lock");
        let mut out = Vec::new();
        let mut bytes = 0usize;
        for (seq, entry) in inner.queue.iter() {
            if out.len() >= max_count {
                break;
            }
            if inner.by_id.get(&entry.tx.id) != Some(seq) {
                continue; // ghost slot
            }
            if !out.is_empty() && bytes + entry.size > max_bytes {
                break;
            }
            match gate.check(&entry.tx) {
                GateDecision::Allow => {
                    bytes += entry.size;
                    out.push(entry.tx.clone());
                }
                GateDecision::Flag { reason } => {
                    self.flagged_total.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(txn = ?entry.tx.id, reason, "transaction flagged, left in mempool");
                }
            }
        }
        out
    }

    /// Drop confirmed transactions after their batch committed and applied.
    pub fn evict(&self, ids: &[TxnId]) {
        let mut inner = self.inner.lock().expect("mempool lock");
        let removed: HashSet<TxnId> = ids
            .iter()
            .filter(|id| inner.by_id.remove(id).is_some())
            .copied()
            .collect();
        if removed.is_empty() {
            return;
        }
        // Reclaim byte accounting; ghost slots are compacted from the front
        // opportunistically.
        let mut reclaimed = 0usize;
        for (_, entry) in inner.queue.iter() {
            if removed.contains(&entry.tx.id) {
                reclaimed += entry.size;
            }
        }
        inner.bytes = inner.bytes.saturating_sub(reclaimed);
        compact_front(&mut inner);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("mempool lock").by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &TxnId) -> bool {
        self.inner
            .lock()
            .expect("mempool lock")
            .by_id
            .contains_key(id)
    }

    pub fn bytes(&self) -> usize {
        self.inner.lock().expect("mempool lock").bytes
    }

    pub fn evicted_total(&self) -> u64 {
        self.evicted_total.load(Ordering::Relaxed)
    }

    pub fn flagged_total(&self) -> u64 {
        self.flagged_total.load(Ordering::Relaxed)
    }
}

/// Drop the oldest live entry; returns false when only ghosts remain.
fn evict_oldest(inner: &mut Inner) -> bool {
    while let Some((seq, entry)) = inner.queue.pop_front() {
        let live = inner.by_id.get(&entry.tx.id) == Some(&seq);
        if live {
            inner.by_id.remove(&entry.tx.id);
            inner.bytes = inner.bytes.saturating_sub(entry.size);
            return true;
        }
    }
    false
}

/// Pop ghost slots off the queue front so it does not grow unboundedly.
fn compact_front(inner: &mut Inner) {
    loop {
        let ghost = match inner.queue.front() {
            Some((seq, entry)) => inner.by_id.get(&entry.tx.id) != Some(seq),
            None => false,
        };
        if !ghost {
            break;
        }
        inner.queue.pop_front();
    }
}
