use tracing::{debug, warn};

use crate::transaction::Transaction;
use crate::versioning::{MergeQueue, PendingMergeTask};

/// Binds merge tasks to the transaction that found them and hands them to the worker pool
/// once that transaction has committed.
#[derive(Clone)]
pub struct MergeScheduler {
    queue: MergeQueue,
}

impl MergeScheduler {
    pub fn new(queue: MergeQueue) -> Self {
        MergeScheduler { queue }
    }

    /// Registers `task` with `tx`. Returns `false` if a task for the same duplicate is
    /// already registered.
    ///
    /// On commit every registered task is submitted exactly once. On rollback they are all
    /// discarded.
    pub fn register(&self, tx: &mut Transaction, task: PendingMergeTask) -> bool {
        let first = tx.pending_merges().is_empty();
        if !tx.bind_merge(task) {
            warn!(duplicate = %task.duplicate, "Merge already registered for this duplicate");
            return false;
        }
        if first {
            let queue = self.queue.clone();
            tx.on_commit(Box::new(move |tasks| {
                debug!("Submitting {} merge tasks", tasks.len());
                for task in tasks {
                    queue.submit(*task);
                }
            }));
            tx.on_rollback(Box::new(|tasks| {
                debug!("Transaction rolled back, discarding {} merge tasks", tasks.len());
            }));
        }
        true
    }
}
