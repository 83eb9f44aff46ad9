//! Parallel batch executor.
//!
//! Dispatches one worker per independent conflict component (bounded by the
//! configured pool size); transactions inside a component execute strictly
//! in batch order. Apply work runs on dedicated OS threads so heavy batches
//! never stall the async runtime, and the call is synchronous from the
//! coordinator's perspective: the next batch's conflict graph cannot be
//! computed against a not-yet-applied prior state.

use std::sync::Arc;

use crate::analyzer::ConflictGraph;
use crate::fatal_invariant;
use crate::raft::{Batch, BatchResult, StateMachine, TxOutcome};

pub struct ParallelExecutor {
    workers: usize,
    sm: Arc<dyn StateMachine>,
}

impl ParallelExecutor {
    pub fn new(workers: usize, sm: Arc<dyn StateMachine>) -> Self {
        Self {
            workers: workers.max(1),
            sm,
        }
    }

    pub fn state_machine(&self) -> &Arc<dyn StateMachine> {
        &self.sm
    }

    /// Apply one committed batch.
    ///
    /// Business-level rejections are recorded per transaction and never
    /// fail the batch. A transaction touching a key outside its declared
    /// access set is a consensus-safety bug: the process stops rather than
    /// continuing with possibly-corrupted state. The same holds for a
    /// conflict graph that does not cover the batch exactly.
    pub fn apply(&self, batch: &Batch, graph: &ConflictGraph) -> BatchResult {
        if graph.transaction_count() != batch.txns.len() {
            fatal_invariant!(
                batch = ?batch.id,
                graph_txns = graph.transaction_count(),
                batch_txns = batch.txns.len(),
                "conflict graph does not cover the batch"
            );
        }

        let mut outcomes: Vec<Option<TxOutcome>> = vec![None; batch.txns.len()];
        if !batch.txns.is_empty() {
            // Components are distributed round-robin over the pool; each
            // worker walks its components in order, so intra-component
            // order is preserved while components run concurrently.
            let lanes = self.workers.min(graph.components.len()).max(1);
            let mut assignments: Vec<Vec<usize>> = vec![Vec::new(); lanes];
            for (i, _) in graph.components.iter().enumerate() {
                assignments[i % lanes].push(i);
            }

            let results = std::thread::scope(|scope| {
                let mut handles = Vec::with_capacity(lanes);
                for lane in &assignments {
                    let sm = &self.sm;
                    handles.push(scope.spawn(move || {
                        let mut lane_outcomes: Vec<(usize, TxOutcome)> = Vec::new();
                        for &comp_idx in lane {
                            for &pos in &graph.components[comp_idx].positions {
                                let tx = &batch.txns[pos];
                                let applied = sm.apply(tx);
                                if !tx.access.covers(&applied.touched) {
                                    fatal_invariant!(
                                        txn = ?tx.id,
                                        declared = ?tx.access,
                                        touched = ?applied.touched,
                                        "transaction touched keys outside its declared access set"
                                    );
                                }
                                lane_outcomes.push((pos, applied.outcome));
                            }
                        }
                        lane_outcomes
                    }));
                }
                handles
                    .into_iter()
                    .map(|h| h.join().expect("executor worker panicked"))
                    .collect::<Vec<_>>()
            });

            for lane_outcomes in results {
                for (pos, outcome) in lane_outcomes {
                    outcomes[pos] = Some(outcome);
                }
            }
        }

        let outcomes = outcomes
            .into_iter()
            .enumerate()
            .map(|(pos, o)| match o {
                Some(outcome) => outcome,
                None => {
                    fatal_invariant!(pos, batch = ?batch.id, "transaction missing from every component");
                }
            })
            .collect();

        BatchResult {
            batch_id: batch.id,
            outcomes,
            state_digest: self.sm.digest(),
        }
    }
}
