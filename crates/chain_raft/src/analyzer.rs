//! Read/write conflict analysis over a transaction batch.
//!
//! The analyzer partitions a batch into disjoint components whose members
//! must execute in batch order; independent components run concurrently.
//! Two strategies are supported; the choice is a cluster-wide configuration
//! invariant because followers replay committed batches with the same
//! grouping the leader used.

use std::collections::HashMap;

use crate::raft::{Batch, Transaction};

/// Conflict-detection strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Keys hashed into a fixed-size bitmap; colliding bits may merge
    /// unrelated transactions (false positives), but truly conflicting
    /// transactions always share a component (no false negatives).
    HashBitmap { bits: u32 },
    /// Exact bookkeeping over the keys touched in the batch. No false
    /// positives, at the cost of per-key maps.
    UnionFind,
}

impl Strategy {
    pub const DEFAULT_HASH_BITS: u32 = 1024;
}

/// One group of transactions that must execute sequentially, identified by
/// their positions in the original batch (ascending).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Component {
    pub positions: Vec<usize>,
}

/// Partition of a batch into independently executable components.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConflictGraph {
    pub components: Vec<Component>,
}

impl ConflictGraph {
    pub fn transaction_count(&self) -> usize {
        self.components.iter().map(|c| c.positions.len()).sum()
    }
}

pub struct DependencyAnalyzer {
    strategy: Strategy,
}

impl DependencyAnalyzer {
    pub fn new(strategy: Strategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Partition `batch` into conflict components.
    ///
    /// A batch where every transaction touches one hot key collapses to a
    /// single component; that is a correct (fully sequential) outcome.
    pub fn analyze(&self, batch: &Batch) -> ConflictGraph {
        let txns = &batch.txns;
        if txns.is_empty() {
            return ConflictGraph {
                components: Vec::new(),
            };
        }

        // Both strategies reduce to the same grouping pass; the hash
        // strategy substitutes bitmap slots for exact keys, so collisions
        // only ever merge components.
        let mut uf = UnionFind::new(txns.len());
        match self.strategy {
            Strategy::UnionFind => {
                group_by_keys(&mut uf, txns, |key| KeyId::Exact(key.clone()));
            }
            Strategy::HashBitmap { bits } => {
                let bits = bits.max(1) as u64;
                group_by_keys(&mut uf, txns, |key| KeyId::Slot(hash_slot(key, bits)));
            }
        }

        // Emit components in first-appearance order, members in batch order.
        let mut by_root: HashMap<usize, usize> = HashMap::new();
        let mut components: Vec<Component> = Vec::new();
        for pos in 0..txns.len() {
            let root = uf.find(pos);
            let slot = *by_root.entry(root).or_insert_with(|| {
                components.push(Component {
                    positions: Vec::new(),
                });
                components.len() - 1
            });
            components[slot].positions.push(pos);
        }
        ConflictGraph { components }
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
enum KeyId {
    Exact(Vec<u8>),
    Slot(u64),
}

fn hash_slot(key: &[u8], bits: u64) -> u64 {
    let digest = blake3::hash(key);
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(word) % bits
}

/// Single grouping pass: a writer conflicts with the previous writer and
/// every reader since that writer; a reader conflicts with the previous
/// writer. Read/read sharing never groups.
fn group_by_keys<F>(uf: &mut UnionFind, txns: &[Transaction], mut key_id: F)
where
    F: FnMut(&Vec<u8>) -> KeyId,
{
    let mut last_writer: HashMap<KeyId, usize> = HashMap::new();
    let mut readers_since_write: HashMap<KeyId, Vec<usize>> = HashMap::new();

    for (pos, tx) in txns.iter().enumerate() {
        for key in &tx.access.writes {
            let id = key_id(key);
            if let Some(&w) = last_writer.get(&id) {
                uf.union(pos, w);
            }
            if let Some(readers) = readers_since_write.remove(&id) {
                for r in readers {
                    uf.union(pos, r);
                }
            }
            last_writer.insert(id, pos);
        }
        for key in &tx.access.reads {
            let id = key_id(key);
            // A key declared in both sets is handled by the write pass.
            if tx.access.writes.iter().any(|w| w == key) {
                continue;
            }
            if let Some(&w) = last_writer.get(&id) {
                uf.union(pos, w);
            }
            readers_since_write.entry(id).or_default().push(pos);
        }
    }
}

/// Path-compressing union-find over batch positions.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            // Lower root wins so grouping stays deterministic.
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}
